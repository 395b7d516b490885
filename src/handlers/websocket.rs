use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::WebSocket;
use warp::{Filter, Rejection, Reply};

use crate::core::connection::Connection;
use crate::core::namespace::Namespace;
use crate::core::server::Server;

/// Upgrade route at `<base_path>/<namespace>` plus a health probe
pub fn routes(
    server: Arc<Server>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let base_path = server.config().base_path.clone();

    let upgrade_route = warp::path(base_path)
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::ws())
        .and(with_server(server))
        .and_then(upgrade);

    let health_route = warp::path("health").and(warp::path::end()).map(|| "OK");

    upgrade_route.or(health_route)
}

fn with_server(
    server: Arc<Server>,
) -> impl Filter<Extract = (Arc<Server>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// Resolves the namespace before the handshake completes; an unregistered
/// path is a 404, never an upgraded connection.
async fn upgrade(
    namespace_name: String,
    query: HashMap<String, String>,
    ws: warp::ws::Ws,
    server: Arc<Server>,
) -> Result<impl Reply, Rejection> {
    let namespace = match server.resolve(&namespace_name) {
        Ok(namespace) => namespace,
        Err(e) => {
            log::info!("Rejecting upgrade: {}", e);
            return Err(warp::reject::not_found());
        }
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, namespace, query)))
}

/// Per-connection task: writer forwarding, middleware-gated registration,
/// read loop, and exactly-one disconnect cleanup on the way out.
pub async fn handle_socket(
    socket: WebSocket,
    namespace: Arc<Namespace>,
    query: HashMap<String, String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Forward messages from the connection's channel to the socket
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_tx.send(message).await {
                log::debug!("Writer task ending: {}", e);
                break;
            }
        }
    });

    let connection = Connection::with_handshake(namespace.path(), query, tx);
    let connection = match namespace.add_connection(connection).await {
        Ok(connection) => connection,
        // Middleware veto: rejection packet and close frame already sent
        Err(_) => return,
    };
    let connection_id = connection.id().to_string();

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(message) => {
                if message.is_close() {
                    break;
                }
                if message.is_text() {
                    if let Ok(text) = message.to_str() {
                        namespace.handle_packet(&connection, text).await;
                    }
                } else {
                    // Binary, transport pings and pongs all count as traffic
                    connection.mark_alive();
                }
            }
            Err(e) => {
                log::debug!("Transport error for {}: {}", connection_id, e);
                break;
            }
        }
    }

    namespace.disconnect(&connection_id).await;
}
