// In-process stand-in for a backend server, used by the client and registry tests.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::sync::oneshot;

use llama_gateway_types::{LoadModelReply, LoadModelRequest};

#[derive(Default)]
pub struct FakeState {
    pub healthy: AtomicBool,
    pub load_ok: AtomicBool,
    pub slow_health: AtomicBool,
    pub health_calls: AtomicUsize,
    pub loads: Mutex<Vec<LoadModelRequest>>,
}

pub struct FakeBackend {
    pub address: String,
    pub state: Arc<FakeState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();

        let state = Arc::new(FakeState::default());
        state.healthy.store(true, Ordering::SeqCst);
        state.load_ok.store(true, Ordering::SeqCst);

        let make_svc = make_service_fn({
            let state = state.clone();
            move |_conn| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, state.clone()))) }
            }
        });

        let (tx, rx) = oneshot::channel::<()>();
        let server = Server::from_tcp(listener)
            .unwrap()
            .serve(make_svc)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            });
        tokio::spawn(server);

        Self {
            address: addr.to_string(),
            state,
            shutdown: Some(tx),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_load_ok(&self, ok: bool) {
        self.state.load_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_slow_health(&self, slow: bool) {
        self.state.slow_health.store(slow, Ordering::SeqCst);
    }

    pub fn health_calls(&self) -> usize {
        self.state.health_calls.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> Vec<LoadModelRequest> {
        self.state.loads.lock().unwrap().clone()
    }

    /// Stop accepting connections, as if the backend process died.
    pub fn kill(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn handle(req: Request<Body>, state: Arc<FakeState>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            state.health_calls.fetch_add(1, Ordering::SeqCst);
            if state.slow_health.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if state.healthy.load(Ordering::SeqCst) {
                Response::new(Body::from("OK"))
            } else {
                status(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
        (&Method::POST, "/load") => {
            let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
            match serde_json::from_slice::<LoadModelRequest>(&bytes) {
                Ok(request) => {
                    state.loads.lock().unwrap().push(request);
                    let reply = LoadModelReply {
                        success: state.load_ok.load(Ordering::SeqCst),
                        message: "fake load".into(),
                    };
                    Response::new(Body::from(serde_json::to_string(&reply).unwrap()))
                }
                Err(_) => status(StatusCode::BAD_REQUEST),
            }
        }
        _ => status(StatusCode::NOT_FOUND),
    };
    Ok(response)
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}
