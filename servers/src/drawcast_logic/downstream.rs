use crate::drawcast_logic::admin;
use crate::drawcast_logic::config::Config;
use crate::drawcast_logic::state::AppState;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use lib_drawcast::SubscriberSession;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(admin::health_handler))
        .route("/status", get(admin::status_handler))
        .route("/targets/{id}/trigger", post(admin::trigger_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(config: Config, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(9010)));

    if let (Some(cert_path), Some(key_path)) = (config.tls_cert_path, config.tls_key_path) {
        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .with_context(|| format!("Failed to load TLS configuration from {}", cert_path.display()))?;

        let handle = axum_server::Handle::new();
        let watcher = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            tracing::info!("Downstream server shutting down.");
            watcher.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        tracing::info!("Downstream server listening on {} (TLS)", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("TLS listener failed")?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        tracing::info!("Downstream server listening on {}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("Downstream server shutting down.");
            })
            .await
            .context("listener failed")?;
    }
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let mut session = match SubscriberSession::open(state.fanout.clone()) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "Subscriber refused");
            let text = lib_drawcast::ServerMessage::Error {
                code: e.code(),
                message: e.to_string(),
            }
            .to_text();
            let _ = sink.send(Message::Text(text.into())).await;
            let _ = sink.close().await;
            return;
        }
    };
    let client_id = session.id();
    tracing::info!(subscriber = client_id, "Client connected");

    let mut ping = tokio::time::interval(state.ping_interval);
    ping.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                last_seen = Instant::now();
                match msg {
                    Message::Text(text) => {
                        let mut failed = false;
                        for reply in session.handle_text(text.as_str()).await {
                            if sink.send(Message::Text(reply.as_ref().into())).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            frame = session.next_frame() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.text.as_ref().into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > state.liveness_timeout {
                    tracing::info!(subscriber = client_id, "Client idle past liveness timeout");
                    let _ = sink.close().await;
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(session);
    tracing::info!(subscriber = client_id, "Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawcast_logic::config::BrokerMode;
    use lib_drawcast::{
        DrawResult, EventFanout, SubscriberLimits, SubscriberRegistry, Target, TargetRegistry,
        TimingClass,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

    async fn serve() -> (SocketAddr, Arc<EventFanout>) {
        let targets = Arc::new(TargetRegistry::new(vec![Target::new(
            "fast-5",
            75,
            TimingClass::ZeroWait,
        )]));
        let fanout = Arc::new(EventFanout::new(Arc::new(SubscriberRegistry::new(
            targets,
            SubscriberLimits::default(),
        ))));
        let state = AppState::new(
            fanout.clone(),
            None,
            BrokerMode::Off,
            Duration::from_secs(20),
            Duration::from_secs(60),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (addr, fanout)
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn websocket_subscriber_receives_pushed_updates() {
        let (addr, fanout) = serve().await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        ws.send(WsMessage::text(r#"{"type":"subscribe","targets":["fast-5"]}"#))
            .await
            .unwrap();
        let ack = next_json(&mut ws).await;
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["targets"], json!(["fast-5"]));

        fanout.publish_local(&DrawResult::new("fast-5", "42", json!({"balls": [1, 2, 3]})));
        let update = next_json(&mut ws).await;
        assert_eq!(update["type"], "update");
        assert_eq!(update["targetId"], "fast-5");
        assert_eq!(update["sequence"], "42");

        ws.send(WsMessage::text("not json")).await.unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
    }

    #[tokio::test]
    async fn health_answers_ok() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (addr, _) = serve().await;
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("OK"));
    }
}
