use std::sync::Arc;

use clap::Parser;

use room_relay::room::{Room, RoomKind};
use room_relay::{routes, Args, ConfigError, InMemoryStore, Server, SignedTokenIdentity};

const LOBBY_ID: &str = "lobby";
const LOBBY_OWNER: &str = "system";

#[tokio::main]
async fn main() -> Result<(), ConfigError> {
    env_logger::init();
    let args = Args::parse();
    let identity = SignedTokenIdentity::new(&args.token_secret).with_ttl(args.token_ttl());

    if let Some(subject) = &args.issue_token {
        let (user_id, username) = subject
            .split_once(':')
            .filter(|(id, name)| !id.is_empty() && !name.is_empty())
            .ok_or_else(|| ConfigError::BadTokenSubject(subject.clone()))?;
        println!("{}", identity.issue(user_id, username)?);
        return Ok(());
    }

    if args.token_secret == "change-me" {
        log::warn!("Using the default token secret; set --token-secret for anything real");
    }

    let store = Arc::new(InMemoryStore::new());
    if let Some(name) = &args.lobby {
        store
            .insert_room(Room::new(LOBBY_ID, name.clone(), RoomKind::Public, LOBBY_OWNER))
            .await;
        log::info!("Seeded public room {LOBBY_ID:?} ({name})");
    }

    let server = Server::new(&args.settings(), store, Arc::new(identity));
    let routes = routes(server);
    let addr = args.addr();

    match args.tls_paths() {
        Some(Ok((cert, key))) => {
            log::info!("Starting secure server (HTTPS/WSS) on {addr}");
            warp::serve(routes).tls().cert_path(cert).key_path(key).run(addr).await;
        }
        Some(Err(e)) => {
            log::warn!("Failed to load TLS material ({e}), falling back to HTTP/WS on {addr}");
            warp::serve(routes).run(addr).await;
        }
        None => {
            log::info!("Starting server (HTTP/WS) on {addr}");
            warp::serve(routes).run(addr).await;
        }
    }
    Ok(())
}
