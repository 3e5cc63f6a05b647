#![allow(dead_code)]

use ota_ui::{
    events::{Action, NotifyLevel, Presenter, WorkflowEvent},
    services::confirmation::{ConfirmationDialog, ConfirmationRequest},
};
use std::sync::{Arc, Mutex};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, tcp::OwnedReadHalf},
    task::JoinHandle,
};

#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub enum Reply {
    Json(u16, String),
    /// Keep the connection open without answering
    Hang,
}

type Responder = dyn Fn(&Request) -> Reply + Send + Sync;

/// In-process device speaking just enough HTTP/1.1 for the client
pub struct MockDevice {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Request>>>,
    server_handle: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start(responder: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock device");
        let addr = listener.local_addr().expect("failed to get local address");

        let requests = Arc::new(Mutex::new(vec![]));
        let responder: Arc<Responder> = Arc::new(responder);

        let server_handle = tokio::spawn(serve(listener, requests.clone(), responder));

        Self {
            base_url: format!("http://{addr}"),
            requests,
            server_handle,
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("failed to lock requests").clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| format!("{} {}", request.method, request.path))
            .collect()
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

async fn serve(
    listener: TcpListener,
    requests: Arc<Mutex<Vec<Request>>>,
    responder: Arc<Responder>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let requests = requests.clone();
        let responder = responder.clone();

        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            // one connection may carry several requests
            while let Some(request) = read_request(&mut reader).await {
                requests
                    .lock()
                    .expect("failed to lock requests")
                    .push(request.clone());

                match responder(&request) {
                    Reply::Json(status, body) => {
                        let http_response = format!(
                            "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                            body.len()
                        );
                        if writer.write_all(http_response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Reply::Hang => {
                        std::future::pending::<()>().await;
                    }
                }
            }
        });
    }
}

async fn read_request(reader: &mut BufReader<OwnedReadHalf>) -> Option<Request> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.ok()? == 0 {
        return None;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = vec![];
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        if line.trim().is_empty() {
            break;
        }
        let (key, value) = line.split_once(':')?;
        headers.push((key.trim().to_string(), value.trim().to_string()));
    }

    let mut request = Request {
        method,
        path,
        headers,
        body: vec![],
    };

    if let Some(len) = request.header("content-length") {
        let mut body = vec![0; len.parse().ok()?];
        reader.read_exact(&mut body).await.ok()?;
        request.body = body;
    } else if request
        .header("transfer-encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"))
    {
        request.body = read_chunked(reader).await?;
    }

    Some(request)
}

async fn read_chunked(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<u8>> {
    let mut body = vec![];
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await.ok()?;
        let size = usize::from_str_radix(size_line.trim().split(';').next()?, 16).ok()?;

        let mut chunk = vec![0; size + 2];
        reader.read_exact(&mut chunk).await.ok()?;
        if size == 0 {
            return Some(body);
        }
        body.extend_from_slice(&chunk[..size]);
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

pub struct FixedDialog(pub bool);

impl ConfirmationDialog for FixedDialog {
    async fn show_dialog(&self, _request: &ConfirmationRequest) -> bool {
        self.0
    }
}

#[derive(Default)]
pub struct RecordingPresenter {
    pub events: Mutex<Vec<WorkflowEvent>>,
    pub notifications: Mutex<Vec<(String, NotifyLevel)>>,
    pub busy: Mutex<Vec<(Action, bool)>>,
}

impl RecordingPresenter {
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().expect("failed to lock events").clone()
    }

    pub fn notifications(&self) -> Vec<(String, NotifyLevel)> {
        self.notifications
            .lock()
            .expect("failed to lock notifications")
            .clone()
    }
}

impl Presenter for RecordingPresenter {
    fn render(&self, event: &WorkflowEvent) {
        self.events
            .lock()
            .expect("failed to lock events")
            .push(event.clone());
    }

    fn notify(&self, message: &str, level: NotifyLevel) {
        self.notifications
            .lock()
            .expect("failed to lock notifications")
            .push((message.to_string(), level));
    }

    fn set_busy(&self, action: Action, busy: bool) {
        self.busy
            .lock()
            .expect("failed to lock busy")
            .push((action, busy));
    }
}
