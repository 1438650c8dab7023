//! Real transport: publishes and subscribes over NSQ. Topic/channel
//! existence is managed through `nsqlookupd`'s HTTP API; message flow goes
//! over a raw TCP connection per `nsqd`, speaking the frame codec in
//! `protocol.rs`.

use super::protocol::{self, Frame};
use super::{Bus, BusHandler, Envelope};
use crate::config::BusConfig;
use crate::error::CoreError;
use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct NsqBus {
    node_name: String,
    config: BusConfig,
    client: reqwest::Client,
    readers: DashMap<String, JoinHandle<()>>,
    writer: AsyncMutex<Option<TcpStream>>,
}

impl NsqBus {
    pub fn new(node_name: impl Into<String>, config: BusConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.lookupd_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            node_name: node_name.into(),
            config,
            client,
            readers: DashMap::new(),
            writer: AsyncMutex::new(None),
        }
    }

    fn nsqd_address(&self) -> Option<&str> {
        self.config.nsqd_tcp_address.first().map(|s| s.as_str())
    }

    /// Best-effort call against every configured `nsqlookupd`. Errors are
    /// logged, not propagated: topic/channel setup failures shouldn't block
    /// the caller.
    async fn lookupd_call(&self, path: &str, query: &[(&str, &str)]) {
        for base in &self.config.lookupd_http_address {
            let url = format!("http://{}{}", base, path);
            let result = self.client.post(&url).query(query).send().await;
            match result {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(url = %url, status = %resp.status(), "nsqlookupd call failed");
                }
                Err(e) => warn!(url = %url, error = %e, "nsqlookupd unreachable"),
                Ok(_) => {}
            }
        }
    }

    async fn ensure_topic(&self, topic: &str) {
        self.lookupd_call("/create_topic", &[("topic", topic)]).await;
    }

    async fn ensure_channel(&self, topic: &str, channel: &str) {
        self.lookupd_call("/create_channel", &[("topic", topic), ("channel", channel)])
            .await;
    }

    async fn connect(&self) -> Result<TcpStream, CoreError> {
        let addr = self
            .nsqd_address()
            .ok_or_else(|| CoreError::BusUnavailable("no nsqd_tcp_address configured".into()))?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;
        stream
            .write_all(protocol::MAGIC_V2)
            .await
            .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;
        stream
            .write_all(&protocol::encode_identify(&self.node_name))
            .await
            .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;
        Ok(stream)
    }
}

#[async_trait]
impl Bus for NsqBus {
    async fn publish(&self, topic: &str, body: serde_json::Value) {
        self.ensure_topic(topic).await;

        let envelope = Envelope {
            origin: self.node_name.clone(),
            msg_body: body,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode envelope");
                return;
            }
        };

        let cmd = protocol::encode_pub(topic, &payload);
        let mut guard = self.writer.lock().await;

        if guard.is_none() {
            match self.connect().await {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    warn!(topic, error = %e, "nsq publish connect failed");
                    return;
                }
            }
        }

        match send_pub(guard.as_mut().unwrap(), &cmd).await {
            Ok(()) => return,
            Err(e) => debug!(topic, error = %e, "nsq publish failed on cached writer, reconnecting"),
        }

        // The cached writer is dead (nsqd closed it, network blip, etc):
        // drop it and retry once on a fresh connection.
        *guard = None;
        match self.connect().await {
            Ok(stream) => {
                *guard = Some(stream);
                if let Err(e) = send_pub(guard.as_mut().unwrap(), &cmd).await {
                    warn!(topic, error = %e, "nsq publish failed after reconnect");
                    *guard = None;
                }
            }
            Err(e) => warn!(topic, error = %e, "nsq publish reconnect failed"),
        }
    }

    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), CoreError> {
        self.ensure_topic(topic).await;
        self.ensure_channel(topic, &self.node_name).await;

        let mut stream = self.connect().await?;
        let topic = topic.to_string();
        let channel = self.node_name.clone();
        let node_name = self.node_name.clone();
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs.max(1));

        stream
            .write_all(&protocol::encode_sub(&topic, &channel))
            .await
            .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;
        stream
            .write_all(&protocol::encode_rdy(1))
            .await
            .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;

        let task = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match read_frame(&mut stream, &mut buf, poll_interval).await {
                    Ok(Some(Frame::Message(msg))) => {
                        let ack_id = msg.id.clone();
                        let deliver = match serde_json::from_slice::<Envelope>(&msg.body) {
                            Ok(envelope) if envelope.origin == node_name => None,
                            Ok(envelope) => Some(envelope.msg_body),
                            Err(e) => {
                                warn!(error = %e, "malformed bus envelope, dropping");
                                None
                            }
                        };

                        let ok = match deliver {
                            Some(body) => handler(body).await,
                            None => true, // self-echo or malformed: ack and move on
                        };

                        let cmd = if ok {
                            protocol::encode_fin(&ack_id)
                        } else {
                            protocol::encode_req(&ack_id, 1000)
                        };
                        if stream.write_all(&cmd).await.is_err() {
                            break;
                        }
                        if stream.write_all(&protocol::encode_rdy(1)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Frame::Response(data))) if data == protocol::HEARTBEAT => {
                        if stream.write_all(&protocol::encode_nop()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Frame::Response(_))) => {}
                    Ok(Some(Frame::Error(data))) => {
                        debug!(error = %String::from_utf8_lossy(&data), "nsq error frame");
                    }
                    Ok(None) => continue, // idle tick, keep polling
                    Err(_) => break,      // connection lost, reader exits
                }
            }
        });

        if let Some(old) = self.readers.insert(topic, task) {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) {
        if let Some((_, task)) = self.readers.remove(topic) {
            task.abort();
        }
    }
}

/// Writes a `PUB` command on an established stream and reads back its
/// response frame, surfacing a server-side `Error` frame as a failure so the
/// caller treats it the same as a dead connection.
async fn send_pub(stream: &mut TcpStream, cmd: &BytesMut) -> Result<(), std::io::Error> {
    stream.write_all(cmd).await?;

    let mut buf = BytesMut::with_capacity(256);
    match read_frame(stream, &mut buf, Duration::from_secs(5)).await? {
        Some(Frame::Response(_)) => Ok(()),
        Some(Frame::Error(data)) => Err(std::io::Error::other(format!(
            "nsqd rejected PUB: {}",
            String::from_utf8_lossy(&data)
        ))),
        Some(Frame::Message(_)) => Err(std::io::Error::other("unexpected message frame on PUB connection")),
        None => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no PUB response within timeout")),
    }
}

/// Read one frame, or `Ok(None)` if nothing arrived within `idle_timeout`
/// (lets the reader loop wake periodically even on a quiet topic).
async fn read_frame(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    idle_timeout: Duration,
) -> Result<Option<Frame>, std::io::Error> {
    loop {
        if let Some(frame) = protocol::decode_frame(buf) {
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; 4096];
        match tokio::time::timeout(idle_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "nsqd closed connection",
                ));
            }
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(None),
        }
    }
}
