use super::conn;
use super::netaddress::NetAddress;
use super::node_info::NodeInfo;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

const SEND_QUEUE_CAPACITY: usize = 256;
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Queued,
    /// The writer is behind; the frame was dropped.
    Full,
    Closed,
}

/// A live, handshaked connection. Outbound frames go through a bounded
/// queue drained by the peer's writer task.
pub struct Peer {
    pub node_info: NodeInfo,
    pub addr: NetAddress,
    pub outbound: bool,
    send_queue: kanal::AsyncSender<(u8, Vec<u8>)>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub(crate) fn new(
        node_info: NodeInfo,
        addr: NetAddress,
        outbound: bool,
    ) -> (Self, kanal::AsyncReceiver<(u8, Vec<u8>)>) {
        let (tx, rx) = kanal::bounded_async(SEND_QUEUE_CAPACITY);
        let (quit, _) = watch::channel(false);
        let peer = Peer {
            node_info,
            addr,
            outbound,
            send_queue: tx,
            quit,
            tasks: Mutex::new(Vec::new()),
        };
        (peer, rx)
    }

    pub fn id(&self) -> String {
        self.node_info.id()
    }

    /// Queues a frame without waiting for room in the queue.
    pub fn try_send(&self, channel: u8, msg: Vec<u8>) -> SendStatus {
        if *self.quit.borrow() {
            return SendStatus::Closed;
        }
        match self.send_queue.try_send((channel, msg)) {
            Ok(true) => SendStatus::Queued,
            Ok(false) => SendStatus::Full,
            Err(_) => SendStatus::Closed,
        }
    }

    /// Like `try_send`, but only reports whether the frame was queued.
    pub fn send(&self, channel: u8, msg: Vec<u8>) -> bool {
        match self.try_send(channel, msg) {
            SendStatus::Queued => true,
            SendStatus::Full => {
                debug!(peer = %self.id(), channel, "send queue full, dropping frame");
                false
            }
            SendStatus::Closed => false,
        }
    }

    pub fn stop(&self) {
        self.quit.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.quit.borrow()
    }

    pub(crate) fn quit_signal(&self) -> watch::Receiver<bool> {
        self.quit.subscribe()
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    #[cfg(test)]
    pub(crate) fn tasks_finished(&self) -> bool {
        self.tasks.lock().iter().all(JoinHandle::is_finished)
    }

    /// Waits for the reader and writer tasks of a stopped peer.
    pub(crate) async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut handle in tasks {
            if time::timeout(JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!(peer = %self.id(), "peer task slow to exit, aborting");
                handle.abort();
            }
        }
    }

    pub(crate) async fn write_loop(
        id: String,
        mut writer: WriteHalf<TcpStream>,
        queue: kanal::AsyncReceiver<(u8, Vec<u8>)>,
        mut quit: watch::Receiver<bool>,
    ) {
        loop {
            let (channel, msg) = tokio::select! {
                _ = quit.wait_for(|q| *q) => break,
                next = queue.recv() => match next {
                    Ok(frame) => frame,
                    Err(_) => break,
                },
            };
            if let Err(err) = conn::send_frame(&mut writer, channel, &msg).await {
                debug!(peer = %id, %err, "write failed");
                break;
            }
        }
        shutdown(&mut writer).await;
    }
}

async fn shutdown(writer: &mut (impl AsyncWrite + Unpin)) {
    use tokio::io::AsyncWriteExt;
    let _ = writer.shutdown().await;
}
