use crate::database::{Database, Episode};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const BACKOFF_DELAYS: [u64; 3] = [2, 8, 30];

/// Filesystem-safe stem derived from an episode guid.
pub fn safe_file_stem(guid: &str) -> String {
    let stem: String = guid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(96)
        .collect();
    if stem.is_empty() {
        "episode".to_string()
    } else {
        stem
    }
}

/// Local source audio for an episode, downloading it if needed.
pub async fn acquire_source(
    db: &Database,
    episode: &Episode,
    episodes_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, String> {
    if let Some(existing) = episode.source_audio_path.as_deref() {
        let path = PathBuf::from(existing);
        if path.exists() {
            log::info!("Reusing downloaded source: {:?}", path);
            return Ok(path);
        }
        log::warn!("Recorded source {:?} is missing, downloading again", path);
    }

    download_episode(db, episode, episodes_dir, cancel).await
}

/// Download episode audio file with streaming, timeouts, and automatic retry
async fn download_episode(
    db: &Database,
    episode: &Episode,
    episodes_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, String> {
    tokio::fs::create_dir_all(episodes_dir)
        .await
        .map_err(|e| format!("Failed to create {:?}: {}", episodes_dir, e))?;

    let stem = safe_file_stem(&episode.guid);
    let file_path = episodes_dir.join(format!("{}.mp3", stem));
    let part_path = episodes_dir.join(format!("{}.mp3.part", stem));

    let mut last_error = String::new();
    for (attempt, delay) in BACKOFF_DELAYS.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err("Download cancelled".to_string());
        }

        match try_download(&episode.audio_url, &part_path).await {
            Ok(file_size) => {
                tokio::fs::rename(&part_path, &file_path)
                    .await
                    .map_err(|e| format!("Failed to move download into place: {}", e))?;
                db.mark_source_downloaded(episode.id, &file_path.to_string_lossy())
                    .map_err(|e| e.to_string())?;
                log::info!("Episode {} source ready ({} bytes)", episode.guid, file_size);
                return Ok(file_path);
            }
            Err(e) => {
                // Clean up partial file
                let _ = tokio::fs::remove_file(&part_path).await;
                last_error = e;

                if attempt + 1 < BACKOFF_DELAYS.len() {
                    log::warn!(
                        "Download attempt {} failed, retrying in {}s: {}",
                        attempt + 1,
                        delay,
                        last_error
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err("Download cancelled".to_string()),
                        _ = tokio::time::sleep(std::time::Duration::from_secs(*delay)) => {}
                    }
                }
            }
        }
    }

    Err(format!(
        "Download failed after {} attempts: {}",
        BACKOFF_DELAYS.len(),
        last_error
    ))
}

/// Single download attempt with streaming and validation
async fn try_download(url: &str, file_path: &Path) -> Result<u64, String> {
    log::info!("Downloading to: {:?}", file_path);

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("Failed to start download: {}", e))?;

    if !response.status().is_success() {
        return Err(format!(
            "Download failed with status: {}",
            response.status()
        ));
    }

    let content_length = response.content_length();
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(file_path)
        .await
        .map_err(|e| format!("Failed to create file: {}", e))?;
    let mut downloaded: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result
            .map_err(|e| format!("Error reading download stream: {}", e))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("Failed to write chunk: {}", e))?;
        downloaded += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| format!("Failed to flush file: {}", e))?;

    // Validate file size against Content-Length
    if let Some(expected) = content_length {
        if downloaded != expected {
            return Err(format!(
                "Download incomplete: got {} bytes, expected {}",
                downloaded, expected
            ));
        }
    }
    if downloaded == 0 {
        return Err("Download returned an empty body".to_string());
    }

    log::info!("Download complete: {} bytes", downloaded);
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tempfile::TempDir;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{}", addr)
    }

    fn setup() -> (TempDir, Database, Episode) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).unwrap();
        let feed_id = db.insert_feed("Show", false).unwrap();
        db.insert_episode("tag:pod,2024:ep/1", feed_id, "Ep 1", "http://unused")
            .unwrap();
        let episode = db.get_episode_by_guid("tag:pod,2024:ep/1").unwrap().unwrap();
        (dir, db, episode)
    }

    #[test]
    fn test_safe_file_stem() {
        assert_eq!(safe_file_stem("tag:pod,2024:ep/1"), "tag_pod_2024_ep_1");
        assert_eq!(safe_file_stem("abc-123_X"), "abc-123_X");
        assert_eq!(safe_file_stem(""), "episode");
        assert_eq!(safe_file_stem(&"x".repeat(300)).len(), 96);
    }

    #[tokio::test]
    async fn test_existing_source_is_reused() {
        let (dir, db, mut episode) = setup();
        let local = dir.path().join("already.mp3");
        std::fs::write(&local, b"ID3").unwrap();
        episode.source_audio_path = Some(local.to_string_lossy().to_string());

        let path = acquire_source(&db, &episode, dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, local);
    }

    #[tokio::test]
    async fn test_download_streams_to_disk_and_records_path() {
        let (dir, db, mut episode) = setup();
        let base = serve(Router::new().route("/ep.mp3", get(|| async { vec![7u8; 4096] }))).await;
        episode.audio_url = format!("{}/ep.mp3", base);

        let episodes_dir = dir.path().join("episodes");
        let path = acquire_source(&db, &episode, &episodes_dir, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, episodes_dir.join("tag_pod_2024_ep_1.mp3"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert!(!episodes_dir.join("tag_pod_2024_ep_1.mp3.part").exists());

        let stored = db.get_episode_by_id(episode.id).unwrap().unwrap();
        assert_eq!(
            stored.source_audio_path.as_deref(),
            Some(path.to_string_lossy().as_ref())
        );
    }

    #[tokio::test]
    async fn test_error_status_fails_attempt() {
        let dir = TempDir::new().unwrap();
        let base = serve(Router::new().route(
            "/gone.mp3",
            get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        ))
        .await;

        let err = try_download(&format!("{}/gone.mp3", base), &dir.path().join("x.part"))
            .await
            .unwrap_err();
        assert!(err.contains("404"), "{}", err);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let (dir, db, episode) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = acquire_source(&db, &episode, dir.path(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, "Download cancelled");
    }
}
