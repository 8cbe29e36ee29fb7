//! Raw frame logging under the `wire` target.
//!
//! Enable with `RUST_LOG=wire=trace`. Frames that carry credentials are
//! logged by size only.

const PREVIEW_CHARS: usize = 512;

fn preview(payload: &str) -> &str {
    match payload.char_indices().nth(PREVIEW_CHARS) {
        Some((end, _)) => &payload[..end],
        None => payload,
    }
}

pub fn log_in(transport: &'static str, opcode: Option<u8>, payload: &str) {
    if !tracing::enabled!(target: "wire", tracing::Level::TRACE) {
        return;
    }
    tracing::trace!(
        target: "wire",
        transport,
        direction = "in",
        opcode = ?opcode,
        bytes = payload.len(),
        payload_preview = preview(payload),
        "frame_in"
    );
}

pub fn log_out(transport: &'static str, opcode: u8, payload: &str, sensitive: bool) {
    if !tracing::enabled!(target: "wire", tracing::Level::TRACE) {
        return;
    }
    let payload_preview = if sensitive { "<redacted>" } else { preview(payload) };
    tracing::trace!(
        target: "wire",
        transport,
        direction = "out",
        opcode,
        bytes = payload.len(),
        payload_preview,
        "frame_out"
    );
}

pub fn log_close(transport: &'static str, direction: &'static str, code: u16, reason: &str) {
    tracing::trace!(
        target: "wire",
        transport,
        direction,
        code,
        reason,
        "close"
    );
}
