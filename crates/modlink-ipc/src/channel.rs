use modlink_core::{ModlinkError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::transport::Transport;

// ─── Line channel ─────────────────────────────────────────────────────────

/// Pump envelopes between `transport` and a byte stream pair, one JSON
/// envelope per line.
///
/// Outbound envelopes are taken from `outbound` (the receiver paired with the
/// transport's sender) and written by a background task. Inbound lines are
/// parsed and handed to [`Transport::on_message`] until `reader` hits EOF, at
/// which point every outstanding call is failed and the function returns.
///
/// Blank lines are skipped. A line that is not a valid envelope is logged and
/// skipped rather than tearing the channel down.
pub async fn run_line_channel<R, W>(
    reader: R,
    writer: W,
    transport: Transport,
    outbound: mpsc::UnboundedReceiver<Envelope>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer_task = tokio::spawn(write_envelopes(writer, outbound));

    let mut lines = BufReader::new(reader).lines();
    let read_result = loop {
        match lines.next_line().await {
            Err(e) => break Err(ModlinkError::Io(e)),
            Ok(None) => break Ok(()),
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(trimmed) {
                    Ok(envelope) => transport.on_message(envelope),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed envelope");
                    }
                }
            }
        }
    };

    tracing::debug!("ipc channel reader finished");
    transport.shutdown();
    writer_task.abort();
    read_result
}

async fn write_envelopes<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Envelope>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        let mut buf = serde_json::to_vec(&envelope)?;
        buf.push(b'\n');
        writer.write_all(&buf).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Run the channel over this process's stdin/stdout.
///
/// Anything else the process prints must go to stderr.
pub async fn run_stdio(transport: Transport, outbound: mpsc::UnboundedReceiver<Envelope>) -> Result<()> {
    run_line_channel(tokio::io::stdin(), tokio::io::stdout(), transport, outbound).await
}
