use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

#[derive(Clone)]
struct CaptureWriter(SharedBuffer);

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CaptureWriter {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

static BUFFER: OnceLock<SharedBuffer> = OnceLock::new();
static TURN: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// Routes tracing output of the test binary into memory. Captures are taken one at a time;
/// the filter of the first capture wins for the whole binary.
pub struct LogCapture {
    buffer: SharedBuffer,
    _turn: OwnedSemaphorePermit,
}

impl LogCapture {
    pub async fn new(filter: &str) -> Self {
        let turn = TURN
            .get_or_init(|| Arc::new(Semaphore::new(1)))
            .clone()
            .acquire_owned()
            .await
            .expect("log capture semaphore closed");
        let buffer = BUFFER
            .get_or_init(|| {
                let buffer = SharedBuffer::default();
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(filter))
                    .with_ansi(false)
                    .compact()
                    .with_writer(CaptureWriter(buffer.clone()))
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
                buffer
            })
            .clone();
        buffer.lock().unwrap_or_else(|err| err.into_inner()).clear();
        Self {
            buffer,
            _turn: turn,
        }
    }

    pub fn text(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|err| err.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
