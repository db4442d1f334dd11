use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::module::ModuleId;
use crate::string::StringIdx;
use crate::thread::ThreadId;
use crate::Word;

pub const GBL_REG_COUNT: usize = 64;
pub const GBL_ARR_COUNT: usize = 64;
pub const HUB_REG_COUNT: usize = 256;
pub const HUB_ARR_COUNT: usize = 256;

/// Identifies one map scope: global id, hub id, map id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScopePath {
    pub gbl: Word,
    pub hub: Word,
    pub map: Word,
}

impl ScopePath {
    pub fn new(gbl: Word, hub: Word, map: Word) -> Self {
        ScopePath { gbl, hub, map }
    }
}

/// Sparse word array. ACS arrays are indexed with arbitrary words and
/// read as zero until written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Array(BTreeMap<Word, Word>);

impl Array {
    pub fn get(&self, idx: Word) -> Word {
        self.0.get(&idx).copied().unwrap_or(0)
    }

    pub fn set(&mut self, idx: Word, val: Word) {
        if val == 0 {
            self.0.remove(&idx);
        } else {
            self.0.insert(idx, val);
        }
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Word, Word)> + '_ {
        self.0.iter().map(|(&k, &v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug)]
pub struct GlobalScope {
    pub active: bool,
    pub regs: Vec<Word>,
    pub arrs: Vec<Array>,
    pub hubs: BTreeMap<Word, HubScope>,
}

impl Default for GlobalScope {
    fn default() -> Self {
        GlobalScope {
            active: false,
            regs: vec![0; GBL_REG_COUNT],
            arrs: vec![Array::default(); GBL_ARR_COUNT],
            hubs: BTreeMap::new(),
        }
    }
}

impl GlobalScope {
    /// Look up or create; idempotent, children start inactive.
    pub fn get_hub(&mut self, id: Word) -> &mut HubScope {
        self.hubs.entry(id).or_default()
    }
}

#[derive(Debug)]
pub struct HubScope {
    pub active: bool,
    pub regs: Vec<Word>,
    pub arrs: Vec<Array>,
    pub maps: BTreeMap<Word, MapScope>,
}

impl Default for HubScope {
    fn default() -> Self {
        HubScope {
            active: false,
            regs: vec![0; HUB_REG_COUNT],
            arrs: vec![Array::default(); HUB_ARR_COUNT],
            maps: BTreeMap::new(),
        }
    }
}

impl HubScope {
    pub fn get_map(&mut self, id: Word) -> &mut MapScope {
        self.maps.entry(id).or_default()
    }
}

/// Where a module-scope slot's storage actually lives. Imports alias
/// another registered module's storage in the same map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRef {
    Local(u32),
    Import { scope: usize, slot: u32 },
    /// Import that has not been matched to an exporter yet; an error if
    /// any remain when module registration finishes.
    Unresolved(StringIdx),
}

/// Per-map, per-module variable storage.
#[derive(Debug, Default)]
pub struct ModuleScope {
    pub module: ModuleId,
    pub regs: Vec<Word>,
    pub arrs: Vec<Array>,
    pub reg_refs: Vec<SlotRef>,
    pub arr_refs: Vec<SlotRef>,
}

/// A queued script start whose delay has not elapsed yet.
#[derive(Clone, Debug)]
pub struct DelayedStart {
    pub module: ModuleId,
    pub script: usize,
    pub args: Vec<Word>,
    pub delay: Word,
}

/// Map scope: module bindings, the live script registry, active threads
/// in insertion order, and the delayed-start queue.
#[derive(Debug, Default)]
pub struct MapScope {
    pub active: bool,
    pub modules: Vec<ModuleId>,
    pub mod_scopes: Vec<ModuleScope>,
    pub threads: Vec<ThreadId>,
    pub delayed: VecDeque<DelayedStart>,
    pub(crate) by_number: HashMap<Word, (ModuleId, usize)>,
    pub(crate) by_name: HashMap<StringIdx, (ModuleId, usize)>,
    /// Scripts that terminated since the last wait-resolution step.
    pub(crate) finished_numbers: Vec<Word>,
    pub(crate) finished_names: Vec<StringIdx>,
}

impl MapScope {
    pub fn module_scope_index(&self, module: ModuleId) -> Option<usize> {
        self.modules.iter().position(|&m| m == module)
    }

    pub fn lookup_number(&self, number: Word) -> Option<(ModuleId, usize)> {
        self.by_number.get(&number).copied()
    }

    pub fn lookup_name(&self, name: StringIdx) -> Option<(ModuleId, usize)> {
        self.by_name.get(&name).copied()
    }

    /// Follow a register slot to its storage cell and read it.
    pub fn mod_reg_get(&self, scope: usize, reg: Word) -> Word {
        let Some(ms) = self.mod_scopes.get(scope) else { return 0 };
        match ms.reg_refs.get(reg as usize) {
            Some(SlotRef::Local(i)) => ms.regs.get(*i as usize).copied().unwrap_or(0),
            Some(SlotRef::Import { scope, slot }) => self.mod_reg_get(*scope, *slot),
            _ => 0,
        }
    }

    pub fn mod_reg_set(&mut self, scope: usize, reg: Word, val: Word) {
        let slot = match self.mod_scopes.get(scope).and_then(|ms| ms.reg_refs.get(reg as usize)) {
            Some(s) => *s,
            None => return,
        };
        match slot {
            SlotRef::Local(i) => {
                if let Some(cell) =
                    self.mod_scopes.get_mut(scope).and_then(|ms| ms.regs.get_mut(i as usize))
                {
                    *cell = val;
                }
            }
            SlotRef::Import { scope, slot } => self.mod_reg_set(scope, slot, val),
            SlotRef::Unresolved(_) => {}
        }
    }

    pub fn mod_arr_get(&self, scope: usize, arr: Word, idx: Word) -> Word {
        let Some(ms) = self.mod_scopes.get(scope) else { return 0 };
        match ms.arr_refs.get(arr as usize) {
            Some(SlotRef::Local(i)) => {
                ms.arrs.get(*i as usize).map(|a| a.get(idx)).unwrap_or(0)
            }
            Some(SlotRef::Import { scope, slot }) => self.mod_arr_get(*scope, *slot, idx),
            _ => 0,
        }
    }

    pub fn mod_arr_set(&mut self, scope: usize, arr: Word, idx: Word, val: Word) {
        let slot = match self.mod_scopes.get(scope).and_then(|ms| ms.arr_refs.get(arr as usize)) {
            Some(s) => *s,
            None => return,
        };
        match slot {
            SlotRef::Local(i) => {
                if let Some(a) =
                    self.mod_scopes.get_mut(scope).and_then(|ms| ms.arrs.get_mut(i as usize))
                {
                    a.set(idx, val);
                }
            }
            SlotRef::Import { scope, slot } => self.mod_arr_set(scope, slot, idx, val),
            SlotRef::Unresolved(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_are_sparse_and_default_zero() {
        let mut a = Array::default();
        assert_eq!(a.get(1000), 0);
        a.set(1000, 7);
        assert_eq!(a.get(1000), 7);
        a.set(1000, 0);
        assert!(a.is_empty());
    }

    #[test]
    fn scope_children_are_created_on_demand() {
        let mut g = GlobalScope::default();
        assert!(!g.get_hub(3).active);
        g.get_hub(3).active = true;
        assert!(g.get_hub(3).active);
        assert_eq!(g.hubs.len(), 1);
    }

    #[test]
    fn import_slots_alias_exporter_storage() {
        let mut map = MapScope::default();
        map.modules = vec![0, 1];
        map.mod_scopes.push(ModuleScope {
            module: 0,
            regs: vec![0; 4],
            reg_refs: (0u32..4).map(SlotRef::Local).collect(),
            ..ModuleScope::default()
        });
        map.mod_scopes.push(ModuleScope {
            module: 1,
            regs: vec![0; 4],
            reg_refs: vec![
                SlotRef::Import { scope: 0, slot: 2 },
                SlotRef::Local(1),
                SlotRef::Local(2),
                SlotRef::Local(3),
            ],
            ..ModuleScope::default()
        });
        map.mod_reg_set(1, 0, 42);
        assert_eq!(map.mod_reg_get(0, 2), 42);
        assert_eq!(map.mod_reg_get(1, 0), 42);
    }
}
