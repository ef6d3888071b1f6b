//! Request/response calls into the bridge.
//!
//! Commands that expect an answer carry a `request_id`. The stdout reader
//! task hands every reply straight to [`PendingRequests`], so a caller
//! awaiting a reply never depends on the event loop making progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use super::protocol::{
    decode_payload, encode_b64, BridgeCommand, BridgeEvent, UploadedMedia, VoiceNote,
};
use crate::history::NameResolver;
use crate::storage::{MediaInfo, MediaType};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

/// Replies awaited by in-flight requests (request_id -> waiter)
pub struct PendingRequests {
    next_id: AtomicI32,
    waiting: RwLock<HashMap<i32, oneshot::Sender<BridgeEvent>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            waiting: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self) -> (i32, oneshot::Receiver<BridgeEvent>) {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiting.write().await.insert(request_id, tx);
        (request_id, rx)
    }

    pub async fn cancel(&self, request_id: i32) {
        self.waiting.write().await.remove(&request_id);
    }

    /// Drop every waiter; their requests fail at once instead of timing out
    pub async fn fail_all(&self) {
        let dropped = std::mem::take(&mut *self.waiting.write().await);
        if !dropped.is_empty() {
            debug!("Abandoning {} pending bridge requests", dropped.len());
        }
    }

    /// Deliver a reply. Returns it back if nobody is waiting for it.
    pub async fn complete(&self, event: BridgeEvent) -> Option<BridgeEvent> {
        let request_id = event.request_id()?;
        let waiter = self.waiting.write().await.remove(&request_id);
        match waiter {
            Some(tx) => tx.send(event).err(),
            None => Some(event),
        }
    }
}

/// Outcome of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: Option<String>,
    pub timestamp: Option<i64>,
}

/// An uploaded payload ready to be sent
#[derive(Debug, Clone)]
pub struct OutgoingMedia {
    pub media_type: MediaType,
    pub mime_type: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
    pub upload: UploadedMedia,
    pub voice: Option<VoiceNote>,
}

/// Cloneable handle for talking to the bridge
#[derive(Clone)]
pub struct BridgeClient {
    command_tx: mpsc::Sender<BridgeCommand>,
    pending: Arc<PendingRequests>,
    own_user: Arc<RwLock<Option<String>>>,
}

impl BridgeClient {
    pub fn new(command_tx: mpsc::Sender<BridgeCommand>, pending: Arc<PendingRequests>) -> Self {
        Self {
            command_tx,
            pending,
            own_user: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember (or forget, on logout) the logged-in user part
    pub async fn set_own_user(&self, user: Option<String>) {
        *self.own_user.write().await = user;
    }

    pub async fn send_command(&self, cmd: BridgeCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .await
            .context("Failed to send command to bridge")
    }

    async fn request<F>(&self, timeout: Duration, build: F) -> Result<BridgeEvent>
    where
        F: FnOnce(i32) -> BridgeCommand,
    {
        let (request_id, rx) = self.pending.register().await;
        if let Err(e) = self.send_command(build(request_id)).await {
            self.pending.cancel(request_id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => bail!("Bridge dropped request {}", request_id),
            Err(_) => {
                self.pending.cancel(request_id).await;
                bail!("Timed out waiting for bridge reply to request {}", request_id)
            }
        }
    }

    pub async fn group_name(&self, jid: &str) -> Result<Option<String>> {
        let jid = jid.to_string();
        match self
            .request(REQUEST_TIMEOUT, |request_id| BridgeCommand::GetGroupInfo { request_id, jid })
            .await?
        {
            BridgeEvent::GroupInfo { error: Some(e), .. } => Err(anyhow!(e)),
            BridgeEvent::GroupInfo { name, .. } => Ok(name.filter(|n| !n.is_empty())),
            other => Err(unexpected("group_info", &other)),
        }
    }

    pub async fn contact_name(&self, jid: &str) -> Result<Option<String>> {
        let jid = jid.to_string();
        match self
            .request(REQUEST_TIMEOUT, |request_id| BridgeCommand::GetContact { request_id, jid })
            .await?
        {
            BridgeEvent::ContactInfo { error: Some(e), .. } => Err(anyhow!(e)),
            BridgeEvent::ContactInfo {
                full_name,
                push_name,
                ..
            } => Ok(full_name
                .filter(|n| !n.is_empty())
                .or(push_name.filter(|n| !n.is_empty()))),
            other => Err(unexpected("contact_info", &other)),
        }
    }

    pub async fn send_text(&self, to: &str, text: &str) -> Result<SendReceipt> {
        let (to, text) = (to.to_string(), text.to_string());
        let reply = self
            .request(REQUEST_TIMEOUT, |request_id| BridgeCommand::SendText {
                request_id,
                to,
                text,
            })
            .await?;
        send_receipt(reply)
    }

    pub async fn upload_media(&self, media_type: MediaType, data: &[u8]) -> Result<UploadedMedia> {
        let data = encode_b64(data);
        match self
            .request(TRANSFER_TIMEOUT, |request_id| BridgeCommand::UploadMedia {
                request_id,
                media_type,
                data,
            })
            .await?
        {
            BridgeEvent::UploadResult { error: Some(e), .. } => Err(anyhow!("Upload failed: {}", e)),
            BridgeEvent::UploadResult {
                upload: Some(upload),
                ..
            } => Ok(upload),
            BridgeEvent::UploadResult { .. } => bail!("Upload result carried no media handles"),
            other => Err(unexpected("upload_result", &other)),
        }
    }

    pub async fn send_media(&self, to: &str, media: OutgoingMedia) -> Result<SendReceipt> {
        let to = to.to_string();
        let reply = self
            .request(REQUEST_TIMEOUT, |request_id| BridgeCommand::SendMedia {
                request_id,
                to,
                media_type: media.media_type,
                mime_type: media.mime_type,
                caption: media.caption,
                file_name: media.file_name,
                upload: media.upload,
                voice: media.voice,
            })
            .await?;
        send_receipt(reply)
    }

    /// Fetch and decrypt a stored media payload
    pub async fn download_media(&self, info: &MediaInfo, direct_path: &str) -> Result<Vec<u8>> {
        let media_type = info.media_type.context("Message has no media")?;
        let cmd = |request_id| BridgeCommand::DownloadMedia {
            request_id,
            media_type,
            direct_path: direct_path.to_string(),
            url: info.url.clone(),
            media_key: encode_b64(&info.media_key),
            file_sha256: encode_b64(&info.file_sha256),
            file_enc_sha256: encode_b64(&info.file_enc_sha256),
            file_length: info.file_length,
        };
        match self.request(TRANSFER_TIMEOUT, cmd).await? {
            BridgeEvent::MediaDownloaded { error: Some(e), .. } => {
                Err(anyhow!("Download failed: {}", e))
            }
            BridgeEvent::MediaDownloaded { data: Some(data), .. } => {
                decode_payload(&data).context("Bridge returned malformed media data")
            }
            BridgeEvent::MediaDownloaded { .. } => bail!("Download returned no data"),
            other => Err(unexpected("media_downloaded", &other)),
        }
    }

    pub async fn request_history_sync(&self) -> Result<()> {
        self.send_command(BridgeCommand::RequestHistorySync).await
    }
}

fn send_receipt(reply: BridgeEvent) -> Result<SendReceipt> {
    match reply {
        BridgeEvent::SendResult {
            success: true,
            message_id,
            timestamp,
            ..
        } => Ok(SendReceipt {
            message_id,
            timestamp,
        }),
        BridgeEvent::SendResult { error, .. } => Err(anyhow!(
            "Send failed: {}",
            error.unwrap_or_else(|| "unknown error".to_string())
        )),
        other => Err(unexpected("send_result", &other)),
    }
}

fn unexpected(expected: &str, got: &BridgeEvent) -> anyhow::Error {
    anyhow!("Expected {} reply, got {:?}", expected, got.kind())
}

#[async_trait]
impl NameResolver for BridgeClient {
    async fn group_name(&self, jid: &str) -> Option<String> {
        match BridgeClient::group_name(self, jid).await {
            Ok(name) => name,
            Err(e) => {
                warn!("Failed to get group info for {}: {}", jid, e);
                None
            }
        }
    }

    async fn contact_name(&self, jid: &str) -> Option<String> {
        match BridgeClient::contact_name(self, jid).await {
            Ok(name) => name,
            Err(e) => {
                debug!("No contact name for {}: {}", jid, e);
                None
            }
        }
    }

    async fn own_user(&self) -> Option<String> {
        self.own_user.read().await.clone()
    }
}
