//! Compute worker test binary for integration tests
//!
//! This binary implements a minimal compute worker speaking the real
//! frame protocol over the Unix socket whose path it receives as its
//! single argument. It is used exclusively by integration tests to
//! exercise worker lifecycle management without a GPU.
//!
//! # Behavior
//!
//! - Connects to the socket path from `argv[1]` and serves frames until
//!   the socket closes.
//! - `GENERATE_REQUEST` -- answers with a deterministic 16x16 RGB
//!   image, echoing the request id. A prompt containing the word
//!   `"fail"` is answered with an `ERROR_RESPONSE` (code 42) instead.
//! - Unknown message types are ignored.
//! - EOF on stdin is the orchestrator's exit request; the process exits
//!   0 promptly when stdin closes.

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use weave::compute::frame::{read_frame, write_frame, MAX_PAYLOAD_LEN};
use weave::compute::{
    ErrorResponse, GenerateRequest, GenerateResponse, GENERATE_REQUEST,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let socket_path = std::env::args()
        .nth(1)
        .expect("usage: compute_test_worker <socket-path>");

    let stream = tokio::net::UnixStream::connect(&socket_path).await?;
    let (mut reader, mut writer) = stream.into_split();

    // Stdin EOF means the orchestrator wants us gone.
    tokio::spawn(async {
        let mut stdin = tokio::io::stdin();
        let mut scratch = [0u8; 64];
        loop {
            match stdin.read(&mut scratch).await {
                Ok(0) | Err(_) => std::process::exit(0),
                Ok(_) => {}
            }
        }
    });

    loop {
        let frame = match read_frame(&mut reader, MAX_PAYLOAD_LEN).await {
            Ok(frame) => frame,
            Err(_) => break,
        };

        if frame.message_type != GENERATE_REQUEST {
            eprintln!(
                "compute_test_worker: ignoring message type {}",
                frame.message_type
            );
            continue;
        }

        let request = match GenerateRequest::from_frame(&frame) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("compute_test_worker: bad request frame: {}", e);
                continue;
            }
        };

        let reply = if request.prompt.contains("fail") {
            ErrorResponse {
                request_id: request.request_id,
                code: 42,
                message: format!("refusing prompt: {}", request.prompt),
            }
            .into_frame()
        } else {
            let (width, height, channels) = (16u32, 16u32, 3u32);
            let mut pixels = Vec::with_capacity((width * height * channels) as usize);
            for y in 0..height {
                for x in 0..width {
                    pixels.push((x * 16) as u8);
                    pixels.push((y * 16) as u8);
                    pixels.push(128);
                }
            }
            GenerateResponse {
                request_id: request.request_id,
                width,
                height,
                channels,
                pixels: Bytes::from(pixels),
            }
            .into_frame()
        };

        if write_frame(&mut writer, &reply).await.is_err() {
            break;
        }
    }

    Ok(())
}
