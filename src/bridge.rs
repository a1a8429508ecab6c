//! Byte-stream bridge between two duplex connections

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Bytes copied in each direction once both sides have closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub left_to_right: u64,
    pub right_to_left: u64,
}

/// Copy bytes both ways until both sides reach EOF or either side errors.
///
/// A half-close on one side is propagated as a shutdown of the other side's
/// write half.
pub async fn connect<L, R>(left: &mut L, right: &mut R) -> std::io::Result<BridgeStats>
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (left_to_right, right_to_left) = tokio::io::copy_bidirectional(left, right).await?;
    debug!(left_to_right, right_to_left, "Bridge closed");
    Ok(BridgeStats {
        left_to_right,
        right_to_left,
    })
}
