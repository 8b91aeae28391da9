//! Two clients chatting through an in-process server, with a room service
//! that counts messages and announces joins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use simple_logger::SimpleLogger;

use rbayeux::context::ServerContext;
use rbayeux::message::Message;
use rbayeux::server::BayeuxServer;
use rbayeux::service::Service;
use rbayeux::types::SessionId;

async fn handshake(server: &BayeuxServer) -> rbayeux::Result<SessionId> {
    let reply = server.handle(Message::new("/meta/handshake")).await.ok_or("handshake reply dropped")?;
    reply.client_id.ok_or_else(|| format!("handshake failed, {:?}", reply.error).into())
}

#[tokio::main]
async fn main() -> rbayeux::Result<()> {
    SimpleLogger::new().with_level(log::LevelFilter::Info).init().map_err(|e| e.to_string())?;

    let scx = ServerContext::default();
    let server = BayeuxServer::new(scx.clone());

    let room = Service::new(&scx, "room").await?;
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let counter = counter.clone();
        room.add_mapping("/chat/*", move |from, msg| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            log::info!("message #{} on {} from {}: {:?}", n, msg.channel, from.id, msg.data);
            Ok(())
        })?;
    }

    let alice = handshake(&server).await?;
    let bob = handshake(&server).await?;
    for id in [&alice, &bob] {
        server.handle(Message::new("/meta/connect").with_client_id(id.clone())).await;
        server
            .handle(Message::new("/meta/subscribe").with_client_id(id.clone()).with_subscription("/chat/lobby"))
            .await;
    }

    room.publish("/chat/lobby", json!({"text": "welcome"})).await?;
    server
        .handle(Message::new("/chat/lobby").with_client_id(alice.clone()).with_data(json!({"text": "hi bob"})))
        .await;

    if let Some(bob_session) = scx.find_session(&bob) {
        for msg in bob_session.drain() {
            log::info!("bob received {}", msg.to_json()?);
        }
    }

    server.handle(Message::new("/meta/disconnect").with_client_id(alice)).await;
    server.handle(Message::new("/meta/disconnect").with_client_id(bob)).await;
    room.stop();
    log::info!("room handled {} message(s), stats: {}", counter.load(Ordering::SeqCst), scx.stats.to_json());
    Ok(())
}
