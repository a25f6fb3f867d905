//! LocalStorage: a self-hosted storage backend behind the [`StorageGateway`]
//! interface. Metadata lives in SQLite, payloads on disk sharded beneath
//! `base_path/{shard}/{shard}/{key}`, and staged multipart parts beneath
//! `base_path/.multipart/{upload_id}/{part_number}`. Clients reach it only
//! through URLs minted by [`UrlSigner`].

use crate::models::{
    multipart::{MultipartPart, MultipartUpload},
    object::StoredObject,
    session::CompletedPart,
};
use crate::services::{
    gateway::{CompletedObject, GatewayError, GatewayResult, ObjectInfo, StorageGateway},
    signer::{SignedOperation, UrlSigner},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MULTIPART_DIR: &str = ".multipart";

#[derive(Clone)]
pub struct LocalStorage {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    signer: UrlSigner,
}

/// Bytes written to a temp file, with their size and running MD5.
struct StagedWrite {
    tmp_path: PathBuf,
    size_bytes: i64,
    digest: md5::Digest,
}

impl LocalStorage {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            signer,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> GatewayResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(GatewayError::InvalidKey);
        }
        if key.starts_with('/') || key.contains("..") || key.starts_with(MULTIPART_DIR) {
            return Err(GatewayError::InvalidKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(GatewayError::InvalidKey);
        }
        Ok(())
    }

    /// Two-level shard identifiers: the first two bytes of MD5(key) as hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Combines base_path/{shard}/{shard}/{key}. Parent directories may not exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(MULTIPART_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.upload_dir(upload_id).join(part_number.to_string())
    }

    async fn fetch_object(&self, key: &str) -> GatewayResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT key, content_type, size_bytes, etag, last_modified
             FROM storage_objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => GatewayError::ObjectNotFound(key.to_string()),
            other => GatewayError::Sqlx(other),
        })
    }

    /// Fetch an open sequence, checking it belongs to `key`.
    async fn fetch_upload(&self, key: &str, upload_id: &str) -> GatewayResult<MultipartUpload> {
        let upload = sqlx::query_as::<_, MultipartUpload>(
            "SELECT upload_id, key, content_type, initiated_at
             FROM storage_multipart_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;

        match upload {
            Some(upload) if upload.key == key => Ok(upload),
            _ => Err(GatewayError::NoSuchUpload(upload_id.to_string())),
        }
    }

    /// Stream bytes into a fresh temp file under `parent`, computing size and
    /// MD5 on the way. The temp file is removed on any error.
    async fn write_temp<S>(&self, parent: &Path, stream: S) -> GatewayResult<StagedWrite>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(GatewayError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(GatewayError::Io(err));
            }
        }
        if let Err(err) = finish_file(&mut file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }

        Ok(StagedWrite {
            tmp_path,
            size_bytes,
            digest: digest.compute(),
        })
    }

    /// Store the body of a signed single PUT.
    ///
    /// Upserts the metadata row (last writer wins) after the payload has been
    /// atomically renamed into place.
    pub async fn put_object_stream<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> GatewayResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let parent = parent_of(&file_path)?;
        let staged = self.write_temp(&parent, stream).await?;
        rename_into_place(&staged.tmp_path, &file_path).await?;

        let etag = format!("{:x}", staged.digest);
        match self
            .upsert_object(key, content_type, staged.size_bytes, &etag)
            .await
        {
            Ok(obj) => Ok(obj),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(err)
            }
        }
    }

    /// Stage the body of a signed part PUT. Re-uploading a part number replaces it.
    pub async fn put_part_stream<S>(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        stream: S,
    ) -> GatewayResult<MultipartPart>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;
        self.fetch_upload(key, upload_id).await?;

        let part_path = self.part_path(upload_id, part_number);
        let parent = parent_of(&part_path)?;
        let staged = self.write_temp(&parent, stream).await?;
        rename_into_place(&staged.tmp_path, &part_path).await?;

        let part = sqlx::query_as::<_, MultipartPart>(
            r#"
            INSERT INTO storage_parts (upload_id, part_number, size_bytes, etag, uploaded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at
            RETURNING upload_id, part_number, size_bytes, etag, uploaded_at
            "#,
        )
        .bind(upload_id)
        .bind(i64::from(part_number))
        .bind(staged.size_bytes)
        .bind(format!("{:x}", staged.digest))
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        debug!(upload_id, part_number, size = part.size_bytes, "staged part");
        Ok(part)
    }

    /// Returns metadata and an opened File handle ready for streaming out.
    pub async fn get_object_reader(&self, key: &str) -> GatewayResult<(StoredObject, File)> {
        self.ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;

        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                GatewayError::ObjectNotFound(key.to_string())
            } else {
                GatewayError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    async fn upsert_object(
        &self,
        key: &str,
        content_type: Option<String>,
        size_bytes: i64,
        etag: &str,
    ) -> GatewayResult<StoredObject> {
        let object = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO storage_objects (key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(key)
        .bind(content_type)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;
        Ok(object)
    }

    /// Drop the sequence rows and its staged part files.
    async fn discard_upload(&self, upload_id: &str) -> GatewayResult<()> {
        sqlx::query("DELETE FROM storage_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM storage_multipart_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;

        let dir = self.upload_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => debug!("removed staged parts {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove staged parts {}: {}", dir.display(), err),
        }
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for LocalStorage {
    async fn issue_put_url(
        &self,
        key: &str,
        _content_type: Option<&str>,
        ttl: Duration,
    ) -> GatewayResult<String> {
        self.ensure_key_safe(key)?;
        Ok(self.signer.sign(key, SignedOperation::PutObject, ttl))
    }

    async fn issue_part_url(
        &self,
        key: &str,
        multipart_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> GatewayResult<String> {
        self.ensure_key_safe(key)?;
        let operation = SignedOperation::PutPart {
            upload_id: multipart_id,
            part_number,
        };
        Ok(self.signer.sign(key, operation, ttl))
    }

    async fn issue_get_url(&self, key: &str, ttl: Duration) -> GatewayResult<String> {
        self.ensure_key_safe(key)?;
        Ok(self.signer.sign(key, SignedOperation::GetObject, ttl))
    }

    async fn open_multipart(&self, key: &str, content_type: Option<&str>) -> GatewayResult<String> {
        self.ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();

        sqlx::query(
            "INSERT INTO storage_multipart_uploads (upload_id, key, content_type, initiated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&upload_id)
        .bind(key)
        .bind(content_type)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        fs::create_dir_all(self.upload_dir(&upload_id)).await?;
        Ok(upload_id)
    }

    /// Concatenate the staged parts into the final object.
    ///
    /// Every listed part must be staged with the same ETag. Staged parts that
    /// are not listed are discarded. The object ETag follows the S3 convention:
    /// MD5 over the binary part digests, suffixed with the part count.
    async fn complete_multipart(
        &self,
        key: &str,
        multipart_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<CompletedObject> {
        self.ensure_key_safe(key)?;
        let upload = self.fetch_upload(key, multipart_id).await?;

        let staged: HashMap<i64, MultipartPart> = sqlx::query_as::<_, MultipartPart>(
            "SELECT upload_id, part_number, size_bytes, etag, uploaded_at
             FROM storage_parts WHERE upload_id = ?",
        )
        .bind(multipart_id)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(|part| (part.part_number, part))
        .collect();

        let mut combined = Context::new();
        for part in parts {
            let stored = staged
                .get(&i64::from(part.part_number))
                .ok_or_else(|| GatewayError::InvalidPart {
                    part_number: part.part_number,
                    reason: "part was never uploaded".into(),
                })?;
            if stored.etag != part.etag {
                return Err(GatewayError::InvalidPart {
                    part_number: part.part_number,
                    reason: format!("expected token {}, got {}", stored.etag, part.etag),
                });
            }
            let raw = hex::decode(&stored.etag).map_err(|_| GatewayError::InvalidPart {
                part_number: part.part_number,
                reason: "stored token is not hex".into(),
            })?;
            combined.consume(&raw);
        }

        let file_path = self.object_path(key);
        let parent = parent_of(&file_path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let assembled = async {
            let mut out = File::create(&tmp_path).await?;
            let mut size_bytes: i64 = 0;
            for part in parts {
                let mut input = File::open(self.part_path(multipart_id, part.part_number)).await?;
                size_bytes += tokio::io::copy(&mut input, &mut out).await? as i64;
            }
            finish_file(&mut out).await?;
            Ok::<_, io::Error>(size_bytes)
        }
        .await;
        let size_bytes = match assembled {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(GatewayError::Io(err));
            }
        };
        rename_into_place(&tmp_path, &file_path).await?;

        let etag = format!("{:x}-{}", combined.compute(), parts.len());
        let object = self
            .upsert_object(key, upload.content_type, size_bytes, &etag)
            .await?;
        self.discard_upload(multipart_id).await?;

        debug!(key, parts = parts.len(), size = size_bytes, "assembled multipart object");
        Ok(CompletedObject {
            etag: object.etag,
            size: Some(object.size_bytes.max(0) as u64),
        })
    }

    async fn abort_multipart(&self, key: &str, multipart_id: &str) -> GatewayResult<()> {
        self.fetch_upload(key, multipart_id).await?;
        self.discard_upload(multipart_id).await
    }

    async fn head_object(&self, key: &str) -> GatewayResult<ObjectInfo> {
        self.ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;
        if fs::metadata(self.object_path(key)).await.is_err() {
            return Err(GatewayError::ObjectNotFound(key.to_string()));
        }
        Ok(ObjectInfo {
            etag: object.etag,
            size: object.size_bytes.max(0) as u64,
        })
    }
}

fn parent_of(path: &Path) -> GatewayResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        GatewayError::Io(io::Error::new(
            ErrorKind::Other,
            "payload path missing parent directory",
        ))
    })
}

/// Flush and fsync before the file is renamed into place.
async fn finish_file(file: &mut File) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

async fn rename_into_place(tmp_path: &Path, final_path: &Path) -> GatewayResult<()> {
    if let Err(err) = fs::rename(tmp_path, final_path).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(final_path).await?;
            fs::rename(tmp_path, final_path).await?;
        } else {
            let _ = fs::remove_file(tmp_path).await;
            return Err(GatewayError::Io(err));
        }
    }
    Ok(())
}
