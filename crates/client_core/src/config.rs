/// Page sizes for the message fetch endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationLimits {
    /// Window loaded when a conversation is opened.
    pub surrounding: u32,
    /// Window loaded when jumping to a message outside the chain.
    pub find_surrounding: u32,
    pub previous: u32,
    pub next: u32,
}

impl Default for PaginationLimits {
    fn default() -> Self {
        Self {
            surrounding: 40,
            find_surrounding: 20,
            previous: 20,
            next: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreOptions {
    pub limits: PaginationLimits,
    /// Emit `StoreEvent::PossibleGap` for the active conversation after a
    /// reconnect refresh.
    pub report_reconnect_gaps: bool,
}
