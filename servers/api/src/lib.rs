//! HTTP front door for the ServerManager control plane. Requests and
//! responses are JSON; every response body is the `{error_code, desp, data}`
//! envelope.

use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use http_body_util::{BodyExt, Full};
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    service::Service,
};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use stream_hub::{
    api::{
        ApiResp, CtrlKickSessionReq, CtrlStartRelayPullReq, CtrlStartRelayPushReq,
        CtrlStartRtpPubReq, CtrlStopRelayPullReq, CtrlStopRelayPushReq, DESP_GROUP_NOT_FOUND,
        ERROR_CODE_GROUP_NOT_FOUND, StatGroup,
    },
    server_manager::ServerManager,
};
use tokio::net::TcpListener;

pub mod errors;

use errors::ApiServerResult;

pub struct HttpApiServer {
    manager: Arc<ServerManager>,
}

impl HttpApiServer {
    pub fn new(manager: Arc<ServerManager>) -> Self {
        Self { manager }
    }

    pub async fn run(&self, addr: SocketAddr) -> ApiServerResult<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(&self, listener: TcpListener) -> ApiServerResult<()> {
        tracing::info!(
            "http api server is running, addr: {}",
            listener.local_addr()?
        );
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("got new http api connection, peer_addr: {}", peer_addr);
            let service = ApiService {
                manager: Arc::clone(&self.manager),
            };
            tokio::spawn(async move {
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!("http api connection closed with error: {:?}", err);
                }
            });
        }
    }
}

#[derive(Clone)]
struct ApiService {
    manager: Arc<ServerManager>,
}

impl Service<Request<Incoming>> for ApiService {
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let manager = Arc::clone(&self.manager);
        Box::pin(async move { handle(manager, req).await })
    }
}

async fn handle(
    manager: Arc<ServerManager>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let accept_gzip = req
        .headers()
        .get("Accept-Encoding")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"));
    let body = req.into_body().collect().await?.to_bytes();

    let response = match path.as_str() {
        "/api/stat/server_info" => {
            json_response(&ApiResp::succ(manager.stat_server_info()), accept_gzip)
        }
        "/api/stat/all_group" => {
            json_response(&ApiResp::succ(manager.stat_all_group().await), accept_gzip)
        }
        "/api/stat/group" => match query_param(query.as_deref(), "stream_name") {
            Some(stream_name) => match manager.stat_group(&stream_name).await {
                Some(stat) => json_response(&ApiResp::succ(stat), accept_gzip),
                None => json_response(
                    &ApiResp::<StatGroup>::fail(ERROR_CODE_GROUP_NOT_FOUND, DESP_GROUP_NOT_FOUND),
                    accept_gzip,
                ),
            },
            None => bad_request("stream_name is required"),
        },
        "/api/ctrl/start_relay_pull" => match parse_body::<CtrlStartRelayPullReq>(&body) {
            Ok(req) => json_response(&manager.ctrl_start_relay_pull(req).await, accept_gzip),
            Err(resp) => resp,
        },
        "/api/ctrl/stop_relay_pull" => match parse_body::<CtrlStopRelayPullReq>(&body) {
            Ok(req) => json_response(
                &manager.ctrl_stop_relay_pull(&req.stream_name).await,
                accept_gzip,
            ),
            Err(resp) => resp,
        },
        "/api/ctrl/start_relay_push" => match parse_body::<CtrlStartRelayPushReq>(&body) {
            Ok(req) => {
                manager
                    .ctrl_start_relay_push(&req.key, &req.addr, req.stream_name.as_deref())
                    .await;
                json_response(&ApiResp::<()>::succ_empty(), accept_gzip)
            }
            Err(resp) => resp,
        },
        "/api/ctrl/stop_relay_push" => match parse_body::<CtrlStopRelayPushReq>(&body) {
            Ok(req) => {
                manager.ctrl_stop_relay_push_by_addr(&req.key).await;
                json_response(&ApiResp::<()>::succ_empty(), accept_gzip)
            }
            Err(resp) => resp,
        },
        "/api/ctrl/kick_session" => match parse_body::<CtrlKickSessionReq>(&body) {
            Ok(req) => json_response(&manager.ctrl_kick_session(req).await, accept_gzip),
            Err(resp) => resp,
        },
        "/api/ctrl/start_rtp_pub" => match parse_body::<CtrlStartRtpPubReq>(&body) {
            Ok(req) => json_response(&manager.ctrl_start_rtp_pub(req).await, accept_gzip),
            Err(resp) => resp,
        },
        _ => status_response(StatusCode::NOT_FOUND, "no such api"),
    };
    Ok(response)
}

fn parse_body<T: serde::de::DeserializeOwned>(
    body: &Bytes,
) -> Result<T, Response<Full<Bytes>>> {
    serde_json::from_slice(body).map_err(|err| bad_request(&format!("bad request body: {}", err)))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

// bodies below this stay uncompressed even when the client accepts gzip
const GZIP_MIN_BYTES: usize = 1024;

fn json_response<T: Serialize>(body: &T, accept_gzip: bool) -> Response<Full<Bytes>> {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!("serialize api response failed: {}", err);
            return status_response(StatusCode::INTERNAL_SERVER_ERROR, "serialize failed");
        }
    };
    if accept_gzip && bytes.len() >= GZIP_MIN_BYTES {
        if let Ok(compressed) = utils::gzip::encode_bytes_by_gzip(&bytes) {
            return Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .header("Content-Encoding", "gzip")
                .body(Full::new(Bytes::from(compressed)))
                .expect("static response parts");
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response parts")
}

fn bad_request(desp: &str) -> Response<Full<Bytes>> {
    status_response(StatusCode::BAD_REQUEST, desp)
}

fn status_response(status: StatusCode, desp: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(desp.to_string())))
        .expect("static response parts")
}
