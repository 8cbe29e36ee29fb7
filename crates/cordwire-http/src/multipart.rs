use bytes::Bytes;
use cordwire_models::message::SendFile;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::error::HttpError;

/// Pipe capacity between the producer task and the request body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A multipart body whose bytes are produced on a background task.
pub(crate) struct MultipartBody {
    pub content_type: String,
    pub body: reqwest::Body,
}

pub(crate) fn random_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(30)
        .map(char::from)
        .collect();
    format!("cordwire{suffix}")
}

fn check_filename(name: &str) -> Result<(), HttpError> {
    if name.is_empty() {
        return Err(HttpError::Multipart("empty file name".to_string()));
    }
    if name.contains(['"', '\r', '\n']) {
        return Err(HttpError::Multipart(format!("file name {name:?} cannot be quoted")));
    }
    Ok(())
}

fn content_type_for(file: &SendFile) -> String {
    file.content_type.clone().unwrap_or_else(|| {
        mime_guess::from_path(&file.name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    })
}

/// Start producing `payload_json` then `file{i}` into a pipe read by the body.
///
/// Filenames are checked up front so a bad name fails before any I/O.
pub(crate) fn build(payload_json: Bytes, files: &[SendFile]) -> Result<MultipartBody, HttpError> {
    for file in files {
        check_filename(&file.wire_name())?;
    }

    let boundary = random_boundary();
    let content_type = format!("multipart/form-data; boundary={boundary}");
    let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);

    let files = files.to_vec();
    tokio::spawn(async move {
        if let Err(err) = write_parts(&mut writer, &boundary, &payload_json, &files).await {
            // The reader side was dropped, usually because the request failed.
            tracing::debug!(error = %err, "multipart producer stopped");
        }
    });

    Ok(MultipartBody {
        content_type,
        body: reqwest::Body::wrap_stream(ReaderStream::new(reader)),
    })
}

pub(crate) async fn write_parts<W>(
    writer: &mut W,
    boundary: &str,
    payload_json: &[u8],
    files: &[SendFile],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"payload_json\"\r\n\
                 Content-Type: application/json\r\n\r\n"
            )
            .as_bytes(),
        )
        .await?;
    writer.write_all(payload_json).await?;
    writer.write_all(b"\r\n").await?;

    for (i, file) in files.iter().enumerate() {
        let head = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file{i}\"; filename=\"{}\"\r\n\
             Content-Type: {}\r\n\r\n",
            file.wire_name(),
            content_type_for(file),
        );
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(&file.data).await?;
        writer.write_all(b"\r\n").await?;
    }

    writer
        .write_all(format!("--{boundary}--\r\n").as_bytes())
        .await?;
    writer.shutdown().await
}
