use std::sync::Arc;

use mockall::automock;

use crate::{
    api::{
        CollHeader, DatatypeId, EndpointAttr, MemHandle, MemberIndex, ReduceOpId,
        ZcopyCompletion,
    },
    error::Result,
};

/// A connection to one peer, able to send active messages.
///
/// Every send either succeeds, fails with [`crate::CollLibError::NoResource`]
/// (nothing was sent, retry later) or fails fatally.
#[automock]
pub trait Endpoint: Send + Sync {
    fn attr(&self) -> EndpointAttr;

    /// Inline send: the payload is copied into the message itself.
    fn am_short(&self, header: CollHeader, payload: &[u8]) -> Result<()>;

    /// Buffered send. Returns the number of bytes handed to the transport.
    fn am_bcopy(&self, header: CollHeader, payload: &[u8]) -> Result<usize>;

    /// Zero-copy send out of registered memory. The transport reports the local
    /// completion later, passing `comp` back to the engine.
    fn am_zcopy(
        &self,
        header: CollHeader,
        payload: &[u8],
        memh: MemHandle,
        comp: ZcopyCompletion,
    ) -> Result<()>;
}

/// Connects members of one group and registers memory for zero-copy sends.
#[automock]
pub trait Transport: Send + Sync {
    fn connect(&self, member: MemberIndex) -> Result<Arc<dyn Endpoint>>;

    /// Largest registrable region. Zero when registration is unsupported.
    fn max_reg(&self) -> usize;

    fn mem_reg(&self, buffer: &[u8]) -> Result<MemHandle>;

    fn mem_dereg(&self, memh: MemHandle) -> Result<()>;
}

/// Applies `op` element-wise: `dst[i] = op(dst[i], src[i])` for `count` elements.
pub trait Reducer: Send + Sync {
    fn reduce(
        &self,
        op: ReduceOpId,
        src: &[u8],
        dst: &mut [u8],
        count: usize,
        datatype: DatatypeId,
    );
}
