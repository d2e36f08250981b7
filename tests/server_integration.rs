mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use h1engine::{HttpError, HttpServer, Request, Response, ServerExchange, ServerHandler, ServerSettings};
use http::StatusCode;
use http::header::{EXPECT, HeaderValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use support::*;

struct App;

#[async_trait]
impl ServerHandler for App {
    async fn handle(&self, exchange: &mut ServerExchange) -> Result<Response, HttpError> {
        match exchange.request.url.path() {
            "/visit" => {
                let session = exchange
                    .session(true)
                    .await
                    .map_err(|err| HttpError::Internal(err.to_string()))?
                    .ok_or_else(|| HttpError::Internal("session not created".into()))?;
                let visits = session
                    .attribute("visits")
                    .map_err(|err| HttpError::Internal(err.to_string()))?
                    .and_then(|value| value.parse::<u32>().ok())
                    .unwrap_or(0)
                    + 1;
                session
                    .set_attribute("visits", visits.to_string())
                    .map_err(|err| HttpError::Internal(err.to_string()))?;
                Ok(Response::new(StatusCode::OK).with_body(visits.to_string()))
            }
            "/slow-upload" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let data = exchange.take_body().collect().await?;
                Ok(Response::new(StatusCode::OK).with_body(format!("{} bytes", data.len())))
            }
            "/upload" => {
                let data = exchange.take_body().collect().await?;
                Ok(Response::new(StatusCode::OK).with_body(format!("{} bytes", data.len())))
            }
            path => Ok(Response::new(StatusCode::OK).with_body(format!("hello {path}"))),
        }
    }
}

async fn start(settings: ServerSettings) -> Result<HttpServer> {
    let server = HttpServer::bind(settings, Arc::new(App)).await?;
    wait_for_listener(server.local_addr()).await?;
    Ok(server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_reuses_server_connection() -> Result<()> {
    let server = start(ServerSettings {
        transaction_log_size: 8,
        ..server_settings()
    })
    .await?;
    let client = client(client_settings())?;
    let base = format!("http://{}", server.local_addr());

    for path in ["/one", "/two", "/three"] {
        let response = client.get(&format!("{base}{path}")).await?;
        assert_eq!(response.body.collect().await?, format!("hello {path}"));
        // lets the connection settle back into the pool
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let records = server.transaction_log().completed();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|record| record.connection_id == records[0].connection_id));
    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_survives_across_requests() -> Result<()> {
    let server = start(server_settings()).await?;
    let client = client(client_settings())?;
    let url = format!("http://{}/visit", server.local_addr());

    let mut last = String::new();
    for _ in 0..3 {
        let body = client.get(&url).await?.body.collect().await?;
        last = String::from_utf8(body.to_vec())?;
    }
    assert_eq!(last, "3");
    assert_eq!(server.sessions().list().await?.len(), 1);
    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_sends_automatic_continue() -> Result<()> {
    let server = start(ServerSettings {
        continue_timeout_ms: 200,
        transaction_log_size: 4,
        ..server_settings()
    })
    .await?;
    let stream = TcpStream::connect(server.local_addr()).await?;
    let mut stream = BufReader::new(stream);
    let started = Instant::now();
    stream
        .get_mut()
        .write_all(
            b"PUT /slow-upload HTTP/1.1\r\nHost: test\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n",
        )
        .await?;

    let interim = read_head(&mut stream).await?;
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(200), "{waited:?}");
    assert!(waited < Duration::from_millis(500), "{waited:?}");

    stream.get_mut().write_all(b"hello").await?;
    let head = read_head(&mut stream).await?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let body = read_body(&mut stream, &head).await?;
    assert_eq!(body, b"5 bytes");

    let mut record = None;
    for _ in 0..100 {
        record = server.transaction_log().completed().pop();
        if record.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = record.expect("exchange was logged");
    assert_eq!(record.continue_sent.as_deref(), Some("auto"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_and_server_negotiate_continue() -> Result<()> {
    let server = start(server_settings()).await?;
    let client = client(client_settings())?;
    let request = Request::put(&format!("http://{}/upload", server.local_addr()), "payload")?
        .with_header(EXPECT, HeaderValue::from_static("100-continue"));

    let started = Instant::now();
    let response = client.send(request).await?;
    assert_eq!(response.body.collect().await?, "7 bytes");
    assert!(started.elapsed() < Duration::from_secs(2));
    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_gets_bad_request() -> Result<()> {
    let server = start(server_settings()).await?;
    let stream = TcpStream::connect(server.local_addr()).await?;
    let mut stream = BufReader::new(stream);
    stream.get_mut().write_all(b"NOT-HTTP\r\n\r\n").await?;
    let mut status = String::new();
    stream.read_line(&mut status).await?;
    assert_eq!(status, "HTTP/1.1 400 Bad Request\r\n");
    Ok(())
}
