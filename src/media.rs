//! Outbound sends and media downloads on top of the bridge.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::audio;
use crate::bridge::protocol::{encode_b64, VoiceNote};
use crate::bridge::{BridgeClient, OutgoingMedia, SendReceipt};
use crate::error::Error;
use crate::storage::{MediaType, MessageStore, USER_SERVER};

/// Address to send to: full addresses pass through, phone numbers get the
/// one-to-one server appended
pub fn recipient_jid(recipient: &str) -> Result<String, Error> {
    let recipient = recipient.trim();
    if recipient.is_empty() {
        return Err(Error::Validation("recipient is required".to_string()));
    }
    if recipient.contains('@') {
        return Ok(recipient.to_string());
    }
    let phone: String = recipient
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-' | '(' | ')'))
        .collect();
    if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Validation(format!(
            "'{recipient}' is neither an address nor a phone number"
        )));
    }
    Ok(format!("{phone}@{USER_SERVER}"))
}

/// Media type and MIME type from the file extension
pub fn classify(path: &Path) -> (MediaType, &'static str) {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => (MediaType::Image, "image/jpeg"),
        "png" => (MediaType::Image, "image/png"),
        "gif" => (MediaType::Image, "image/gif"),
        "webp" => (MediaType::Image, "image/webp"),
        "ogg" => (MediaType::Audio, "audio/ogg; codecs=opus"),
        "mp4" => (MediaType::Video, "video/mp4"),
        "avi" => (MediaType::Video, "video/avi"),
        "mov" => (MediaType::Video, "video/quicktime"),
        _ => (MediaType::Document, "application/octet-stream"),
    }
}

/// How a file will be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMedia {
    pub media_type: MediaType,
    pub mime_type: &'static str,
    pub voice: Option<VoiceNote>,
}

/// Classify a payload; Ogg audio becomes a voice note, or a plain document
/// when it does not parse as Ogg
pub fn prepare_media(path: &Path, data: &[u8]) -> PreparedMedia {
    let (media_type, mime_type) = classify(path);
    if media_type != MediaType::Audio {
        return PreparedMedia {
            media_type,
            mime_type,
            voice: None,
        };
    }

    match audio::analyze_ogg_opus(data) {
        Ok(info) => PreparedMedia {
            media_type,
            mime_type,
            voice: Some(VoiceNote {
                seconds: info.duration_seconds,
                waveform: encode_b64(&info.waveform),
            }),
        },
        Err(e) => {
            warn!("{} is not a voice note ({}), sending as a file", path.display(), e);
            PreparedMedia {
                media_type: MediaType::Document,
                mime_type: "application/octet-stream",
                voice: None,
            }
        }
    }
}

/// Send a text message, or a file with `message` as its caption
pub async fn send_message(
    bridge: &BridgeClient,
    recipient: &str,
    message: &str,
    media_path: Option<&Path>,
) -> Result<SendReceipt> {
    let to = recipient_jid(recipient)?;

    let Some(path) = media_path else {
        if message.is_empty() {
            return Err(Error::Validation("message or media path is required".to_string()).into());
        }
        let receipt = bridge.send_text(&to, message).await?;
        info!("Sent message to {}", to);
        return Ok(receipt);
    };

    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read media file {}", path.display()))?;
    let prepared = prepare_media(path, &data);
    let upload = bridge
        .upload_media(prepared.media_type, &data)
        .await
        .context("Failed to upload media")?;

    let caption = match prepared.media_type {
        MediaType::Audio => None,
        _ => Some(message.to_string()).filter(|m| !m.is_empty()),
    };
    let file_name = match prepared.media_type {
        MediaType::Document => path.file_name().map(|n| n.to_string_lossy().into_owned()),
        _ => None,
    };

    let receipt = bridge
        .send_media(
            &to,
            OutgoingMedia {
                media_type: prepared.media_type,
                mime_type: prepared.mime_type.to_string(),
                caption,
                file_name,
                upload,
                voice: prepared.voice,
            },
        )
        .await?;
    info!("Sent {} to {}", prepared.media_type.as_str(), to);
    Ok(receipt)
}

/// Path of the CDN object inside a media URL: everything after `.net/` up
/// to the query string, with a leading `/`
pub fn extract_direct_path(url: &str) -> String {
    match url.split_once(".net/") {
        Some((_, rest)) => {
            let path = rest.split('?').next().unwrap_or(rest);
            format!("/{path}")
        }
        None => url.to_string(),
    }
}

/// Per-chat media directory; `:` is not allowed in file names everywhere
pub fn chat_media_dir(data_dir: &Path, chat_jid: &str) -> PathBuf {
    data_dir.join(chat_jid.replace(':', "_"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedMedia {
    pub media_type: MediaType,
    pub filename: String,
    pub path: PathBuf,
}

/// Make a message's media available on disk, downloading it if needed
pub async fn download_media(
    store: &MessageStore,
    bridge: &BridgeClient,
    data_dir: &Path,
    id: &str,
    chat_jid: &str,
) -> Result<DownloadedMedia> {
    let info = store.get_media_info(id, chat_jid)?;
    let media_type = info
        .media_type
        .ok_or_else(|| Error::Validation(format!("message {id} has no media")))?;

    // Never let a stored document name escape the chat directory
    let filename = Path::new(&info.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}_{}", media_type.as_str(), id));

    let dir = chat_media_dir(data_dir, chat_jid);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let local = dir.join(&filename);

    if tokio::fs::try_exists(&local).await.unwrap_or(false) {
        return Ok(DownloadedMedia {
            media_type,
            filename,
            path: absolute(&local).await,
        });
    }

    if !info.is_downloadable() {
        return Err(Error::Validation(format!(
            "incomplete media information for message {id}"
        ))
        .into());
    }

    info!("Downloading {} for message {} in {}", media_type.as_str(), id, chat_jid);
    let data = bridge
        .download_media(&info, &extract_direct_path(&info.url))
        .await?;
    tokio::fs::write(&local, &data)
        .await
        .with_context(|| format!("Failed to write {}", local.display()))?;
    info!("Saved {} bytes to {}", data.len(), local.display());

    Ok(DownloadedMedia {
        media_type,
        filename,
        path: absolute(&local).await,
    })
}

async fn absolute(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{BridgeCommand, BridgeEvent};
    use crate::bridge::client::PendingRequests;
    use crate::storage::{MediaInfo, StoredMessage};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const CHAT: &str = "111@s.whatsapp.net";

    /// Client whose bridge answers downloads with `payload` and nothing else
    fn downloading_bridge(payload: &'static [u8]) -> BridgeClient {
        let (tx, mut rx) = mpsc::channel::<BridgeCommand>(4);
        let pending = Arc::new(PendingRequests::new());
        let replies = pending.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let BridgeCommand::DownloadMedia { request_id, direct_path, .. } = cmd {
                    assert_eq!(direct_path, "/v/t62.7118-24/abc_n.enc");
                    replies
                        .complete(BridgeEvent::MediaDownloaded {
                            request_id,
                            data: Some(encode_b64(payload)),
                            error: None,
                        })
                        .await;
                }
            }
        });
        BridgeClient::new(tx, pending)
    }

    fn offline_bridge() -> BridgeClient {
        let (tx, _) = mpsc::channel(1);
        BridgeClient::new(tx, Arc::new(PendingRequests::new()))
    }

    fn store_with(media: MediaInfo) -> MessageStore {
        let store = MessageStore::open_in_memory().unwrap();
        store.upsert_chat(CHAT, "Alice", Utc::now()).unwrap();
        store
            .upsert_message(&StoredMessage {
                id: "m1".to_string(),
                chat_jid: CHAT.to_string(),
                sender: "111".to_string(),
                content: "caption".to_string(),
                timestamp: Utc::now(),
                is_from_me: false,
                media,
            })
            .unwrap();
        store
    }

    fn full_media() -> MediaInfo {
        MediaInfo {
            media_type: Some(MediaType::Image),
            filename: "image_20240119_183000.jpg".to_string(),
            url: "https://mmg.whatsapp.net/v/t62.7118-24/abc_n.enc?ccb=11-4&oh=x".to_string(),
            media_key: vec![1; 32],
            file_sha256: vec![2; 32],
            file_enc_sha256: vec![3; 32],
            file_length: 7,
        }
    }

    #[test]
    fn test_recipient_jid() {
        assert_eq!(recipient_jid("+44 7700-900123").unwrap(), "447700900123@s.whatsapp.net");
        assert_eq!(recipient_jid("120363@g.us").unwrap(), "120363@g.us");
        assert!(recipient_jid("").unwrap_err().is_validation());
        assert!(recipient_jid("alice").unwrap_err().is_validation());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Path::new("a/photo.JPG")), (MediaType::Image, "image/jpeg"));
        assert_eq!(classify(Path::new("clip.mov")).0, MediaType::Video);
        assert_eq!(classify(Path::new("note.ogg")).0, MediaType::Audio);
        assert_eq!(
            classify(Path::new("report")),
            (MediaType::Document, "application/octet-stream")
        );
    }

    #[test]
    fn test_extract_direct_path() {
        assert_eq!(
            extract_direct_path("https://mmg.whatsapp.net/v/t62.7118-24/abc_n.enc?ccb=11-4"),
            "/v/t62.7118-24/abc_n.enc"
        );
        assert_eq!(extract_direct_path("no-cdn-here"), "no-cdn-here");
    }

    #[test]
    fn test_prepare_media_voice_note_and_fallback() {
        let mut ogg = b"OggS".to_vec();
        ogg.resize(10_000, 0);
        let prepared = prepare_media(Path::new("note.ogg"), &ogg);
        assert_eq!(prepared.media_type, MediaType::Audio);
        assert_eq!(prepared.voice.as_ref().map(|v| v.seconds), Some(5));

        let prepared = prepare_media(Path::new("fake.ogg"), b"ID3 not ogg at all");
        assert_eq!(prepared.media_type, MediaType::Document);
        assert!(prepared.voice.is_none());

        let prepared = prepare_media(Path::new("pic.png"), b"\x89PNG");
        assert_eq!(prepared.media_type, MediaType::Image);
    }

    #[test]
    fn test_chat_media_dir() {
        let dir = chat_media_dir(Path::new("/data"), "111:4@s.whatsapp.net");
        assert_eq!(dir, Path::new("/data/111_4@s.whatsapp.net"));
    }

    #[tokio::test]
    async fn test_download_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(full_media());
        let bridge = downloading_bridge(b"jpegdat");

        let media = download_media(&store, &bridge, tmp.path(), "m1", CHAT).await.unwrap();
        assert_eq!(media.media_type, MediaType::Image);
        assert_eq!(std::fs::read(&media.path).unwrap(), b"jpegdat");
        assert!(media.path.ends_with("111@s.whatsapp.net/image_20240119_183000.jpg"));
    }

    #[tokio::test]
    async fn test_download_reuses_local_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(MediaInfo {
            media_type: Some(MediaType::Document),
            filename: "../../report.pdf".to_string(),
            ..Default::default()
        });
        let dir = chat_media_dir(tmp.path(), CHAT);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("report.pdf"), b"pdf").unwrap();

        // The bridge is offline, so only the local copy can satisfy this
        let media = download_media(&store, &offline_bridge(), tmp.path(), "m1", CHAT)
            .await
            .unwrap();
        assert_eq!(media.filename, "report.pdf");
    }

    #[tokio::test]
    async fn test_download_refusals() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = offline_bridge();

        let store = store_with(MediaInfo::default());
        let err = download_media(&store, &bridge, tmp.path(), "m1", CHAT).await.unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some_and(Error::is_validation));

        let store = store_with(MediaInfo {
            media_type: Some(MediaType::Video),
            filename: "video_1.mp4".to_string(),
            ..Default::default()
        });
        let err = download_media(&store, &bridge, tmp.path(), "m1", CHAT).await.unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some_and(Error::is_validation));

        let err = download_media(&store, &bridge, tmp.path(), "missing", CHAT)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some_and(Error::is_not_found));
    }

    #[tokio::test]
    async fn test_send_requires_content() {
        let err = send_message(&offline_bridge(), "123", "", None).await.unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some_and(Error::is_validation));
    }
}
