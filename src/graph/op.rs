/// An enumeration of all possible tensor operations.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    /// A named symbolic input with no backing storage.
    Placeholder,
    /// A tensor produced by a named, separately compiled routine.
    ///
    /// The node carries no body. Lowering must emit a single opaque packed
    /// call with the node's inputs followed by its output buffer; it may
    /// never inline or analyze the routine.
    Extern {
        /// The registry symbol the call dispatches to.
        symbol: String,
        /// Total buffer arguments of the packed call (inputs + output).
        num_buffer_args: usize,
    },
    /// An element-wise identity over the single input.
    Copy,
}

impl GraphOp {
    /// Returns `true` if the node is realized by a packed call instead of
    /// generated code.
    pub fn is_extern(&self) -> bool {
        matches!(self, GraphOp::Extern { .. })
    }

    /// Returns `true` if the node is a graph input.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, GraphOp::Placeholder)
    }
}
