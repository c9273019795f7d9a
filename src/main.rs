use std::time::Duration;

use wirepool::{ReadRequest, TcpClient, TcpServer, WriteRequest};

/// Echo every read back to the peer, then re-arm.
fn arm_echo(client: &TcpClient) {
    let chained = client.clone();
    let _ = client.async_read(ReadRequest {
        size_to_read: 1024,
        on_complete: Some(Box::new(move |result| {
            if !result.success {
                return;
            }
            let _ = chained.async_write(WriteRequest {
                buffer: result.buffer,
                on_complete: None,
            });
            arm_echo(&chained);
        })),
    });
}

fn main() -> wirepool::Result<()> {
    let server = TcpServer::new()?;
    server.start("127.0.0.1", 3001, |client| {
        println!("client connected from {}:{}", client.host(), client.port());
        arm_echo(client);
        false
    })?;
    println!("echo server listening on 127.0.0.1:3001");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
