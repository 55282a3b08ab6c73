//! Rodata constant-pool registry: deduplicated string labels and
//! not-deduplicated user-named labels.
//!
//! spec.md §3 specifies this as an external collaborator contract only
//! ("an opaque label registry"); it's implemented here as a concrete
//! module so the crate is runnable end-to-end, grounded on the
//! `register_string`/`register_label_name`/`get_name` contract verbatim.

use std::collections::HashMap;
use std::rc::Rc;

pub type LabelId = u32;

#[derive(Default)]
pub struct RodataRegistry {
    names: Vec<Rc<str>>,
    string_index: HashMap<Vec<u8>, LabelId>,
    next_anon: u32,
}

impl RodataRegistry {
    pub fn new() -> Self {
        RodataRegistry::default()
    }

    /// Deduplicated: identical byte sequences always share one label.
    pub fn register_string(&mut self, bytes: &[u8]) -> LabelId {
        if let Some(&id) = self.string_index.get(bytes) {
            return id;
        }
        let id = self.names.len() as LabelId;
        let name: Rc<str> = Rc::from(format!(".L_rodata{}", self.next_anon));
        self.next_anon += 1;
        self.names.push(name);
        self.string_index.insert(bytes.to_vec(), id);
        id
    }

    /// Not deduplicated: every call allocates a fresh label, even for a
    /// repeated name (distinct compound literals, for instance).
    pub fn register_label_name(&mut self, name: &str) -> LabelId {
        let id = self.names.len() as LabelId;
        self.names.push(Rc::from(name));
        id
    }

    pub fn get_name(&self, id: LabelId) -> Rc<str> {
        self.names[id as usize].clone()
    }

    /// Every deduplicated string label with its byte content, for the
    /// object emitter's `.rodata` pass. Labels from `register_label_name`
    /// carry no byte content here and are omitted.
    pub fn string_entries(&self) -> Vec<(Rc<str>, Vec<u8>)> {
        let mut by_id: Vec<Option<&Vec<u8>>> = vec![None; self.names.len()];
        for (bytes, &id) in &self.string_index {
            by_id[id as usize] = Some(bytes);
        }
        self.names
            .iter()
            .zip(by_id)
            .filter_map(|(name, bytes)| bytes.map(|b| (name.clone(), b.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_dedup_by_bytes() {
        let mut r = RodataRegistry::new();
        let a = r.register_string(b"foo");
        let b = r.register_string(b"foo");
        let c = r.register_string(b"bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn label_names_are_not_deduped() {
        let mut r = RodataRegistry::new();
        let a = r.register_label_name(".compoundliteral0");
        let b = r.register_label_name(".compoundliteral0");
        assert_ne!(a, b);
        assert_eq!(&*r.get_name(a), ".compoundliteral0");
    }
}
