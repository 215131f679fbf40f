/// What a table accepts as content.
pub trait TableKind: Send + Sync + 'static {
    const NAME: &'static str;
    /// Whether a null address may be stored.
    const ALLOWS_NULL: bool;
}

/// Pointers to embedder objects outside the cage.
#[derive(Debug)]
pub enum External {}

impl TableKind for External {
    const NAME: &'static str = "external pointer";
    const ALLOWS_NULL: bool = true;
}

/// Pointers to trusted runtime objects outside the cage. Never null.
#[derive(Debug)]
pub enum Trusted {}

impl TableKind for Trusted {
    const NAME: &'static str = "trusted pointer";
    const ALLOWS_NULL: bool = false;
}
