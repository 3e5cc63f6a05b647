use anyhow::{Context, Result, ensure};
use futures_util::{Stream, StreamExt, stream};
use reqwest::{Body, Client, Response};
use std::{io, time::Duration};
use tokio::sync::mpsc::UnboundedSender;

/// Size of the slices a firmware image is streamed in
pub const UPLOAD_CHUNK_BYTES: usize = 16 * 1024;

/// Create the HTTP client used to talk to the device
///
/// No overall request timeout is set since a firmware upload over a weak
/// WiFi link may take minutes. Requests that need one set it themselves.
///
/// # Arguments
/// * `connect_timeout` - Maximum time to establish the TCP connection
pub fn device_http_client(connect_timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .context("failed to create device HTTP client")
}

/// Wrap `data` into a streamed request body reporting progress
///
/// After each chunk is handed to the transport the running byte count is sent
/// on `progress`. A closed receiver is not an error, the upload just continues
/// without reporting.
pub fn progress_body(data: Vec<u8>, progress: UnboundedSender<u64>) -> Body {
    Body::wrap_stream(progress_chunks(data, progress))
}

fn progress_chunks(
    data: Vec<u8>,
    progress: UnboundedSender<u64>,
) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + Sync + 'static {
    let chunks: Vec<Vec<u8>> = data
        .chunks(UPLOAD_CHUNK_BYTES)
        .map(<[u8]>::to_vec)
        .collect();
    let mut sent = 0u64;

    stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        let _ = progress.send(sent);
        Ok(chunk)
    })
}

/// Handle HTTP response by checking status and extracting body
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `context_msg` - Context message describing the request (e.g., "GET /api/ota/info")
///
/// # Returns
/// * `Ok(String)` - The response body if the status is successful
/// * `Err` - If the status is not successful or reading the body fails
pub async fn handle_http_response(res: Response, context_msg: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {body}"
    );

    Ok(body)
}
