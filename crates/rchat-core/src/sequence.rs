/// Issues segment sequence numbers for one session: 0, 1, 2, ...
#[derive(Debug, Default, Clone)]
pub struct SequenceAllocator {
    next: u64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }

    /// The value the next call to [`allocate`](Self::allocate) returns.
    pub fn peek(&self) -> u64 {
        self.next
    }
}
