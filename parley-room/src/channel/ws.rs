//! WebSocket room channel.
//!
//! One background task per room owns the socket. It connects to
//! `{base_url}/{room_id}`, forwards text frames both ways, and after a lost
//! connection reconnects with capped exponential backoff. Frames handed to
//! the channel while no socket is open wait in an [`OfflineQueue`] and are
//! flushed, in order, on the next open.
//!
//! Delivery is best effort: a full queue drops frames, and nothing is
//! acknowledged end to end. Reconciliation does not depend on it.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ChannelEvent, ChannelHandle};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket channel configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Relay base URL, e.g. `ws://localhost:1999/parties/main`.
    pub base_url: String,
    /// Frames held while disconnected.
    pub queue_capacity: usize,
    /// Buffer size of the handle's outgoing and event channels.
    pub channel_capacity: usize,
    /// Reconnect after a lost or failed connection.
    pub reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl WsConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            queue_capacity: 1024,
            channel_capacity: 256,
            reconnect: true,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Full socket URL for a room.
pub fn room_url(base_url: &str, room_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), room_id)
}

/// Frames waiting for a connection.
pub struct OfflineQueue {
    queue: VecDeque<String>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a frame. Returns `false` when the queue is full.
    pub fn enqueue(&mut self, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    /// Put frames that could not be sent back at the front, in order.
    pub fn requeue(&mut self, frames: Vec<String>) {
        for frame in frames.into_iter().rev() {
            self.queue.push_front(frame);
        }
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(String::len).sum()
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How a connected period ended.
enum ConnectionEnd {
    /// Socket closed or failed; the task may reconnect.
    Lost,
    /// The handle was dropped; the task exits.
    Shutdown,
}

/// WebSocket binding of a room channel.
pub struct WsChannel;

impl WsChannel {
    /// Spawn the socket task for `room_id` and return its handle.
    ///
    /// Returns immediately; `ChannelEvent::Open` arrives once the socket
    /// is up. Must be called inside a Tokio runtime.
    pub fn connect(config: WsConfig, room_id: impl Into<String>) -> ChannelHandle {
        let room_id = room_id.into();
        let (out_tx, out_rx) = mpsc::channel(config.channel_capacity);
        let (evt_tx, evt_rx) = mpsc::channel(config.channel_capacity);

        let url = room_url(&config.base_url, &room_id);
        tokio::spawn(drive(url, config, out_rx, evt_tx));

        ChannelHandle::from_parts(room_id, out_tx, evt_rx)
    }
}

fn queue_frame(queue: &mut OfflineQueue, frame: String) {
    if !queue.enqueue(frame) {
        log::warn!("Offline queue full ({} frames), dropping frame", queue.len());
    }
}

async fn drive(
    url: String,
    config: WsConfig,
    mut outgoing: mpsc::Receiver<String>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let mut queue = OfflineQueue::new(config.queue_capacity);
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);
    let mut was_open = false;

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                log::info!("Connected to {url}");
                backoff.reset();
                was_open = true;
                if events.send(ChannelEvent::Open).await.is_err() {
                    return;
                }
                match run_connection(stream, &mut outgoing, &events, &mut queue).await {
                    ConnectionEnd::Shutdown => {
                        log::debug!("Channel to {url} shut down");
                        return;
                    }
                    ConnectionEnd::Lost => {
                        log::warn!("Connection to {url} lost ({} frames queued)", queue.len());
                        if events.send(ChannelEvent::Closed).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("Connection to {url} failed: {e}");
                if !config.reconnect && !was_open {
                    let _ = events.send(ChannelEvent::Closed).await;
                }
            }
        }

        if !config.reconnect {
            return;
        }

        // Keep accepting frames while waiting to reconnect.
        let sleep = tokio::time::sleep(backoff.next_delay());
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                frame = outgoing.recv() => match frame {
                    Some(frame) => queue_frame(&mut queue, frame),
                    None => return,
                },
            }
        }
    }
}

async fn run_connection(
    stream: WsStream,
    outgoing: &mut mpsc::Receiver<String>,
    events: &mpsc::Sender<ChannelEvent>,
    queue: &mut OfflineQueue,
) -> ConnectionEnd {
    let (mut writer, mut reader) = stream.split();

    let queued = queue.drain();
    if !queued.is_empty() {
        log::info!("Replaying {} queued frames", queued.len());
    }
    let mut replay = queued.into_iter();
    while let Some(frame) = replay.next() {
        if let Err(e) = writer.send(Message::Text(frame.clone().into())).await {
            log::warn!("Replay failed: {e}");
            queue.requeue(std::iter::once(frame).chain(replay).collect());
            return ConnectionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(Message::Text(frame.clone().into())).await {
                        log::warn!("Send failed: {e}");
                        queue_frame(queue, frame);
                        return ConnectionEnd::Lost;
                    }
                }
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
            },
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if events.send(ChannelEvent::Frame(text.as_str().to_owned())).await.is_err() {
                        return ConnectionEnd::Shutdown;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        if events.send(ChannelEvent::Frame(text)).await.is_err() {
                            return ConnectionEnd::Shutdown;
                        }
                    }
                    Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Lost,
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {e}");
                    return ConnectionEnd::Lost;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Relay stand-in: echoes every text frame back to its sender.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_text() && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn fast_config(base_url: String) -> WsConfig {
        WsConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..WsConfig::new(base_url)
        }
    }

    #[test]
    fn test_room_url() {
        assert_eq!(room_url("ws://host/parties/main", "lobby"), "ws://host/parties/main/lobby");
        assert_eq!(room_url("ws://host/", "lobby"), "ws://host/lobby");
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue("abc".into());
        queue.enqueue("defg".into());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained, vec!["abc".to_string(), "defg".to_string()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue("1".into()));
        assert!(queue.enqueue("2".into()));
        assert!(!queue.enqueue("3".into()));
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_requeue_keeps_order() {
        let mut queue = OfflineQueue::new(10);
        queue.enqueue("c".into());
        queue.requeue(vec!["a".into(), "b".into()]);
        assert_eq!(queue.drain(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_ws_channel_echo() {
        let base = echo_server().await;
        let mut handle = WsChannel::connect(fast_config(base), "lobby");
        assert_eq!(handle.room_id(), "lobby");

        // Sent before the socket is open: delivered after connect.
        handle.send(r#"{"type":"early"}"#.into()).unwrap();

        assert_eq!(handle.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            handle.recv().await,
            Some(ChannelEvent::Frame(r#"{"type":"early"}"#.into()))
        );

        handle.send(r#"{"type":"late"}"#.into()).unwrap();
        assert_eq!(
            handle.recv().await,
            Some(ChannelEvent::Frame(r#"{"type":"late"}"#.into()))
        );
    }

    #[tokio::test]
    async fn test_ws_channel_unreachable_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = WsConfig {
            reconnect: false,
            ..fast_config(format!("ws://{addr}"))
        };
        let mut handle = WsChannel::connect(config, "lobby");
        assert_eq!(handle.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(handle.recv().await, None);
    }

    #[tokio::test]
    async fn test_ws_channel_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection is dropped right after the handshake.
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            drop(ws);

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() && ws.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut handle = WsChannel::connect(fast_config(format!("ws://{addr}")), "lobby");
        assert_eq!(handle.recv().await, Some(ChannelEvent::Open));
        assert_eq!(handle.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(handle.recv().await, Some(ChannelEvent::Open));

        handle.send("again".into()).unwrap();
        assert_eq!(handle.recv().await, Some(ChannelEvent::Frame("again".into())));
    }
}
