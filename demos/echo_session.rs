//! Echo over TCP with both ends driven by one selector
//!
//! The HTTP upgrade is out of scope here: both sides agree to speak frames
//! as soon as the TCP connection is up.
//!
//! Run with: cargo run --example echo_session

use std::net::{TcpListener, TcpStream};

use pollframe::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pollframe=debug".into()),
        )
        .init();

    let selector = Selector::new(SelectorConfig::default())?;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let client_tcp = TcpStream::connect(addr)?;
    let (server_tcp, _) = listener.accept()?;

    let server_io = PolledStream::tcp(server_tcp, selector.handle())?;
    let mut server = WebSocketSession::new(server_io, Role::Server, Config::default());
    let server_task = tokio::spawn(async move {
        while let Some(frame) = server.recv().await {
            if matches!(frame.opcode(), OpCode::Text | OpCode::Binary) {
                server.send(frame)?;
            }
        }
        server.close_reason().await
    });

    let client_io = PolledStream::tcp(client_tcp, selector.handle())?;
    let mut client = WebSocketSession::new(client_io, Role::Client, Config::default());

    for line in ["hello", "from", "pollframe"] {
        client.send(Frame::text(line))?;
        if let Some(echo) = client.recv().await {
            println!("echo: {}", echo.as_text()?);
        }
    }

    client.close(CloseReason::NORMAL, "bye");
    println!("client closed: {:?}", client.close_reason().await);

    match server_task.await {
        Ok(reason) => println!("server closed: {reason:?}"),
        Err(e) => eprintln!("server task failed: {e}"),
    }
    Ok(())
}
