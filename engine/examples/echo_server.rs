use std::sync::Arc;

use riptide::{CancelToken, Connection, Engine, EngineConfig};

async fn echo(conn: Arc<Connection>) {
    loop {
        let snapshot = conn.read_async().await;
        let mut wrote = false;
        while let Some(item) = conn.try_get_ring(&snapshot) {
            if let Err(e) = conn.write(item.as_slice()) {
                eprintln!("write error: {e}");
            } else {
                wrote = true;
            }
            conn.return_ring(item.buffer_id());
        }
        if wrote {
            match conn.flush_async() {
                Ok(flush) => {
                    if let Err(e) = flush.await {
                        eprintln!("flush error: {e}");
                    }
                }
                Err(e) => eprintln!("flush error: {e}"),
            }
        }
        if snapshot.is_closed() {
            return;
        }
        conn.reset_read();
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if !riptide::supported() {
        eprintln!("this kernel does not support the required io_uring features");
        return;
    }

    let mut config = EngineConfig::default();
    config.port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7878);
    config.reactors = 2;
    config.reactor[0].buffer_ring_entries = 128;
    config.reactor[0].recv_buffer_size = 4096;
    config.reactor[0].max_connections = 1024;

    let mut engine = Engine::new(config).expect("failed to bind");
    engine.start().expect("failed to start engine");
    eprintln!("echo server listening on {}", engine.local_addr());

    let cancel = CancelToken::new();
    while let Some(conn) = engine.accept_async(&cancel).await {
        tokio::spawn(echo(conn));
    }
}
