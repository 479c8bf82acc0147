use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::actions::Transmitter;

/// A command is whatever arrives in the first read, up to this many bytes.
pub const MAX_COMMAND_LEN: usize = 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("command is not ascii")]
    NotAscii,
}

/// Turn the received bytes into a code name.
pub fn parse_command(data: &[u8]) -> Result<&str, CommandError> {
    let data = data.trim_ascii();
    if data.is_empty() {
        return Err(CommandError::Empty);
    }
    if !data.is_ascii() {
        return Err(CommandError::NotAscii);
    }
    std::str::from_utf8(data).map_err(|_| CommandError::NotAscii)
}

/// Accept connections until cancelled, each one sends a single name.
///
/// Every connection runs as its own task on `tracker`; at most `max_connections` are
/// served at once.
pub async fn serve<T>(
    listener: TcpListener,
    tx: Arc<T>,
    max_connections: usize,
    tracker: TaskTracker,
    token: CancellationToken,
) where
    T: Transmitter + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening for commands on {}", addr);
    }

    let permits = Arc::new(Semaphore::new(max_connections.max(1)));

    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        let tx = tx.clone();
        tracker.spawn(async move {
            let _permit = permit;
            handle_connection(stream, peer, tx).await;
        });
    }

    info!("Command listener stopped");
}

async fn handle_connection<T>(mut stream: TcpStream, peer: SocketAddr, tx: Arc<T>)
where
    T: Transmitter + 'static,
{
    let mut buf = [0u8; MAX_COMMAND_LEN];

    let len = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(len)) => len,
        Ok(Err(e)) => {
            warn!("Reading from {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("No command from {} within {:?}", peer, READ_TIMEOUT);
            return;
        }
    };

    match parse_command(&buf[..len]) {
        Ok(name) => {
            debug!("Incoming command from {}: {}", peer, name);
            // Sending blocks on the serial port.
            let name = name.to_string();
            if let Err(e) = tokio::task::spawn_blocking(move || tx.send_by_name(&name)).await {
                warn!("Command from {} failed: {}", peer, e);
            }
        }
        Err(e) => warn!("Ignoring command from {}: {}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingTransmitter, Sent};
    use tokio::io::AsyncWriteExt;

    #[test]
    fn parses_padded_names() {
        assert_eq!(parse_command(b"samsung_tv_standby"), Ok("samsung_tv_standby"));
        assert_eq!(parse_command(b"  multi_amp_volup\r\n"), Ok("multi_amp_volup"));
        assert_eq!(parse_command(b"two words\n"), Ok("two words"));
        assert_eq!(parse_command(b" \n\t"), Err(CommandError::Empty));
        assert_eq!(parse_command("stand\u{e9}by".as_bytes()), Err(CommandError::NotAscii));
    }

    async fn start(
        tx: Arc<RecordingTransmitter>,
    ) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>, TaskTracker) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let server = tokio::spawn(serve(listener, tx, 4, tracker.clone(), token.clone()));
        (addr, token, server, tracker)
    }

    #[tokio::test]
    async fn forwards_one_name_per_connection() {
        let tx = Arc::new(RecordingTransmitter::default());
        let (addr, token, server, tracker) = start(tx.clone()).await;

        for name in ["samsung_tv_standby\n", "multi_amp_volup"] {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(name.as_bytes()).await.unwrap();
            client.shutdown().await.unwrap();

            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        }

        token.cancel();
        server.await.unwrap();
        tracker.close();
        tracker.wait().await;

        assert_eq!(
            tx.sent(),
            vec![
                Sent::Name("samsung_tv_standby".into()),
                Sent::Name("multi_amp_volup".into())
            ]
        );
    }

    #[tokio::test]
    async fn empty_connection_sends_nothing() {
        let tx = Arc::new(RecordingTransmitter::default());
        let (addr, token, server, tracker) = start(tx.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        token.cancel();
        server.await.unwrap();
        tracker.close();
        tracker.wait().await;

        assert!(tx.sent().is_empty());
    }

    #[derive(Default)]
    struct ThreadRecorder(parking_lot::Mutex<Vec<std::thread::ThreadId>>);

    impl Transmitter for ThreadRecorder {
        fn send_by_name(&self, _name: &str) {
            self.0.lock().push(std::thread::current().id());
        }

        fn send_by_code(&self, _code: &ircontrol_shared::IrCode) {}
    }

    #[tokio::test]
    async fn sends_off_the_runtime_thread() {
        let tx = Arc::new(ThreadRecorder::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let server = tokio::spawn(serve(listener, tx.clone(), 4, tracker.clone(), token.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"samsung_tv_standby").await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        token.cancel();
        server.await.unwrap();
        tracker.close();
        tracker.wait().await;

        let threads = tx.0.lock().clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }
}
