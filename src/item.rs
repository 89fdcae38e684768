//! Mutation payloads and checkpoint queue entries.

use bytes::Bytes;

use crate::types::{Vbid, VbucketState};

/// Datatype bits carried per item, matching the wire protocol.
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
}

/// Fixed per-item metadata overhead used for footprint accounting.
const ITEM_META_OVERHEAD: usize = 56;

/// A single key/value mutation or deletion labeled with its per-vbucket
/// sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub vbucket: Vbid,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub flags: u32,
    pub expiration: u32,
    pub datatype: u8,
    pub deleted: bool,
}

impl Item {
    pub fn new(key: impl Into<Bytes>, value: Option<Bytes>, vbucket: Vbid, by_seqno: u64) -> Self {
        Self {
            key: key.into(),
            value,
            vbucket,
            by_seqno,
            rev_seqno: 1,
            cas: 0,
            flags: 0,
            expiration: 0,
            datatype: datatype::RAW,
            deleted: false,
        }
    }

    pub fn deletion(key: impl Into<Bytes>, vbucket: Vbid, by_seqno: u64) -> Self {
        let mut item = Self::new(key, None, vbucket, by_seqno);
        item.deleted = true;
        item
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, Bytes::len)
    }

    /// In-core footprint, used for buffer accounting.
    pub fn size(&self) -> usize {
        self.key.len() + self.value_len() + ITEM_META_OVERHEAD
    }

    pub fn is_compressed(&self) -> bool {
        self.datatype & datatype::SNAPPY != 0
    }

    /// Copy of the item with its value stripped, for key-only streams.
    pub fn key_only(&self) -> Self {
        let mut item = self.clone();
        item.value = None;
        item.datatype &= !datatype::SNAPPY;
        item
    }
}

/// One entry of a checkpoint-manager batch. State changes ride the same
/// queue as mutations so a stream observes them in seqno order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueuedItem {
    Item(Item),
    SetVBucketState(VbucketState),
}

impl QueuedItem {
    pub fn by_seqno(&self) -> Option<u64> {
        match self {
            QueuedItem::Item(item) => Some(item.by_seqno),
            QueuedItem::SetVBucketState(_) => None,
        }
    }
}
