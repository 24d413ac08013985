use thiserror::Error;

/// All errors that can occur while wiring or unwiring a hook.
#[derive(Debug, Error)]
pub enum HookError {
    /// Allocation of an executable buffer failed.
    #[error("executable allocation of {size} bytes failed: {source}")]
    Alloc {
        size: usize,
        source: windows::core::Error,
    },

    /// A page-protection change was rejected.
    #[error("memory protection change failed at {address:#x}: {source}")]
    Protection {
        address: usize,
        #[source]
        source: windows::core::Error,
    },

    /// The prologue contains bytes the decoder cannot make sense of.
    #[error("invalid instruction bytes at {address:#x}")]
    InvalidBytes { address: usize },

    /// The prologue starts with an instruction that cannot be moved
    /// (rip-relative operand or a branch inside the patch window).
    #[error("unrelocatable instruction at {address:#x}")]
    UnrelocatableInstruction { address: usize },

    /// Fewer decodable bytes than the patch needs to displace.
    #[error("not enough prologue bytes at {address:#x} ({have} of {need})")]
    NotEnoughBytes {
        address: usize,
        have: usize,
        need: usize,
    },

    /// Re-encoding the relocated instructions failed.
    #[error("trampoline encoding failed for {address:#x}: {reason}")]
    Encoding { address: usize, reason: String },

    /// Target memory is not readable enough to install a hook over.
    #[error("target at {address:#x} is not readable")]
    UnreadableTarget { address: usize },
}
