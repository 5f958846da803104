//! Hierarchical resource identity (spec.md §3): an ordered sequence of
//! path segments naming a node in the database → table → page → record
//! tree.

use std::fmt;

use crate::codec::{Decode, Encode};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    segments: Vec<String>,
}

impl ResourceName {
    pub fn new(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn root() -> Self {
        Self { segments: vec![] }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// `None` for the root; otherwise the prefix minus the last segment.
    pub fn parent(&self) -> Option<ResourceName> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Prefix containment: `self` names a node at or below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &ResourceName) -> bool {
        self.segments.len() >= ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl Encode for ResourceName {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.segments.len() as u16).encode(buf);
        for s in &self.segments {
            s.encode(buf);
        }
    }
}

impl Decode for ResourceName {
    fn decode(reader: &mut impl std::io::Read) -> crate::codec::DecodeResult<Self> {
        let count = u16::decode(reader)? as usize;
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            segments.push(String::decode(reader)?);
        }
        Ok(Self { segments })
    }
}
