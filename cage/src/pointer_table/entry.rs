//! Entry word layout.
//!
//! ```text
//!  63  62..58  57..56  55..48  47..0
//!  M   unused  kind    tag     payload
//! ```
//!
//! `kind` is 0 for free entries, 1 for live ones and 2 for evacuation
//! entries. A free entry's payload is `next | len << 24`, where `len` counts
//! the freelist from this entry to its end. The all-zero word is a free entry
//! terminating the list, so fresh and decommitted memory needs no setup.

use crate::{pointer_table::PointerTag, sandbox::Address};

pub(crate) const PAYLOAD_BITS: u32 = 48;
pub(crate) const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;
const TAG_SHIFT: u32 = 48;
const KIND_SHIFT: u32 = 56;
const KIND_MASK: u64 = 0b11;
pub(crate) const MARK_BIT: u64 = 1 << 63;

const KIND_FREE: u64 = 0;
const KIND_LIVE: u64 = 1;
const KIND_EVACUATION: u64 = 2;

const FREE_FIELD_BITS: u32 = 24;
const FREE_FIELD_MASK: u64 = (1 << FREE_FIELD_BITS) - 1;

/// Largest address a live or evacuation entry can hold.
pub const MAX_ENTRY_ADDRESS: Address = PAYLOAD_MASK as Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Free {
        next: u32,
        freelist_len: u32,
    },
    Live {
        address: Address,
        tag: PointerTag,
        marked: bool,
    },
    Evacuation {
        handle_slot: Address,
    },
}

impl Entry {
    pub(crate) const NULL: Self = Entry::Live {
        address: 0,
        tag: PointerTag::NULL,
        marked: false,
    };

    #[inline(always)]
    pub fn encode(self) -> u64 {
        match self {
            Entry::Free { next, freelist_len } => {
                debug_assert!(u64::from(next) <= FREE_FIELD_MASK);
                debug_assert!(u64::from(freelist_len) <= FREE_FIELD_MASK);
                (KIND_FREE << KIND_SHIFT)
                    | (u64::from(freelist_len) << FREE_FIELD_BITS)
                    | u64::from(next)
            }
            Entry::Live {
                address,
                tag,
                marked,
            } => {
                debug_assert!(address as u64 <= PAYLOAD_MASK);
                let mark = if marked { MARK_BIT } else { 0 };
                mark | (KIND_LIVE << KIND_SHIFT)
                    | (u64::from(tag.raw()) << TAG_SHIFT)
                    | address as u64
            }
            Entry::Evacuation { handle_slot } => {
                debug_assert!(handle_slot as u64 <= PAYLOAD_MASK);
                (KIND_EVACUATION << KIND_SHIFT) | handle_slot as u64
            }
        }
    }

    /// Returns `None` for words no valid entry encodes to.
    #[inline(always)]
    pub fn decode(word: u64) -> Option<Self> {
        let payload = word & PAYLOAD_MASK;
        match (word >> KIND_SHIFT) & KIND_MASK {
            KIND_FREE => Some(Entry::Free {
                next: (payload & FREE_FIELD_MASK) as u32,
                freelist_len: ((payload >> FREE_FIELD_BITS) & FREE_FIELD_MASK) as u32,
            }),
            KIND_LIVE => Some(Entry::Live {
                address: payload as Address,
                tag: PointerTag::from_bits((word >> TAG_SHIFT) as u8),
                marked: word & MARK_BIT != 0,
            }),
            KIND_EVACUATION => Some(Entry::Evacuation {
                handle_slot: payload as Address,
            }),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_marked(word: u64) -> bool {
        word & MARK_BIT != 0
    }

    #[inline(always)]
    pub fn clear_mark(word: u64) -> u64 {
        word & !MARK_BIT
    }
}
