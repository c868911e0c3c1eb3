use async_trait::async_trait;
use bytes::Bytes;
use dubreamer_engine::hls::{FetchKind, Origin};
use dubreamer_engine::{Config, RelayError, ValidationOptions};
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

/// Origin whose playlists never parse; pipelines keep polling and degrade.
pub struct OfflineOrigin;

#[async_trait]
impl Origin for OfflineOrigin {
    async fn fetch(&self, url: &Url, _kind: FetchKind, _timeout: Duration) -> Result<Bytes, RelayError> {
        Err(RelayError::playlist(format!("{url} is offline")))
    }
}

/// Origin that serves a one-segment playlist and never answers segment
/// requests, leaving every pipeline stuck mid-cycle.
#[derive(Default)]
pub struct StallingOrigin {
    stalled: Notify,
}

impl StallingOrigin {
    /// Resolves once a segment fetch is hanging.
    pub async fn stalled(&self) {
        self.stalled.notified().await;
    }
}

#[async_trait]
impl Origin for StallingOrigin {
    async fn fetch(&self, _url: &Url, kind: FetchKind, _timeout: Duration) -> Result<Bytes, RelayError> {
        match kind {
            FetchKind::Playlist => Ok(Bytes::from_static(
                b"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:1\n#EXTINF:4.0,\n1.ts\n",
            )),
            FetchKind::Segment => {
                self.stalled.notify_one();
                std::future::pending().await
            }
        }
    }
}

pub fn config_toml(stream: Option<&str>) -> String {
    let mut text = String::from("port = 9191\n[auth]\nusername = \"ops\"\npassword = \"s3cret\"\n");
    if let Some(name) = stream {
        text.push_str(&format!(
            "[stream.{name}]\nurl = \"http://origin.invalid/{name}/index.m3u8\"\npoll_interval_ms = 50\n"
        ));
    }
    text
}

pub fn config_with_stream(stream: Option<&str>) -> Config {
    Config::from_toml_str(&config_toml(stream), ValidationOptions::default()).unwrap()
}
