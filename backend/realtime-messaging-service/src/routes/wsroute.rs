use crate::error::{AppError, ChatError};
use crate::middleware::guards::upgrade_credential;
use crate::state::AppState;
use crate::websocket::events::{ClientEvent, ServerEvent};
use crate::websocket::{ConnectionId, Session};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse, ResponseError};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub auth: Option<String>,
    pub token: Option<String>,
}

/// Transport shell around a gateway [`Session`]. Parses frames, forwards
/// events in arrival order and writes whatever the gateway queues.
struct WsSession {
    user_id: Uuid,
    connection_id: ConnectionId,
    inbound: Option<UnboundedSender<ClientEvent>>,
    outbound: Option<UnboundedReceiver<String>>,
    hb: Instant,
}

impl WsSession {
    fn new(session: Session) -> Self {
        Self {
            user_id: session.principal.user_id,
            connection_id: session.connection_id,
            inbound: Some(session.inbound),
            outbound: Some(session.outbound),
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(user_id = %act.user_id, "websocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn forward(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(user_id = %self.user_id, error = %e, "unparseable frame");
                let reply = ServerEvent::request_error(
                    "unknown",
                    &ChatError::InvalidPayload(e.to_string()),
                );
                if let Ok(json) = reply.to_json() {
                    ctx.text(json);
                }
                return;
            }
        };

        let delivered = self
            .inbound
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false);
        if !delivered {
            tracing::warn!(connection_id = %self.connection_id, "gateway session gone, closing");
            ctx.stop();
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, connection_id = %self.connection_id, "websocket session started");
        self.hb(ctx);
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Closing the inbound channel ends the gateway task, which runs cleanup.
        self.inbound.take();
        tracing::info!(user_id = %self.user_id, connection_id = %self.connection_id, "websocket session stopped");
    }
}

/// Frames queued by the gateway for this socket.
impl StreamHandler<String> for WsSession {
    fn handle(&mut self, frame: String, ctx: &mut Self::Context) {
        ctx.text(frame);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::debug!(connection_id = %self.connection_id, "outbound channel closed");
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                self.forward(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("binary websocket frames not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(?reason, "websocket close received");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgrade endpoint. The credential is verified before the upgrade; a refused
/// credential gets a 401 naming the failure and no socket.
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let params = query.into_inner();
    let credential = upgrade_credential(&req, params.auth.as_deref(), params.token.as_deref());

    let session = match state.gateway.connect(credential.as_deref()).await {
        Ok(session) => session,
        Err(failure) => {
            tracing::warn!(reason = failure.code(), "websocket upgrade rejected");
            return Ok(AppError::from(failure).error_response());
        }
    };

    ws::start(WsSession::new(session), &req, stream)
}
