pub mod body;
pub mod client;
pub mod codec;
pub mod cookie;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod server;
pub mod settings;
pub mod tls;
pub mod transaction_log;
pub mod transport;
pub mod util;

pub use body::{Body, BodySender, ReplayBuffer, duplicate};
pub use client::{HttpClient, ProxySettings, RequestHandler};
pub use cookie::{CookieJar, CookieStore};
pub use error::{BodyError, ErrorKind, HttpError, TimeoutKind};
pub use message::{ContinueOutcome, NoRetry, Request, Response};
pub use server::{ConnectionHandler, HttpServer, ServerExchange, ServerHandler};
pub use settings::{ClientSettings, FollowRedirects, LogFormat, ServerSettings};
