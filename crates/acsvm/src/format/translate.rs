//! Source-opcode to internal-code translation.
//!
//! The code segment is decoded with a worklist seeded from every known
//! entry point: script offsets, function offsets, and declared jump
//! targets. Decoding runs linearly from each seed until a terminal
//! instruction. Unknown opcodes become `Kill`; branch targets that never
//! decoded resolve to the reserved `Kill` at index 0. Translation
//! therefore never fails: malformed code faults the thread that runs
//! it, not the load.

use std::collections::{BTreeMap, HashMap};

use crate::code::{Code, CodeData};
use crate::Word;

pub(crate) struct Translated {
    pub code: Vec<Word>,
    pub map: HashMap<u32, u32>,
    pub jump_maps: Vec<BTreeMap<Word, Word>>,
}

impl Translated {
    /// Code index for a source byte offset; unmapped offsets land on the
    /// reserved `Kill`.
    pub fn resolve(&self, byte_off: u32) -> u32 {
        self.map.get(&byte_off).copied().unwrap_or(0)
    }
}

pub(crate) struct Translator<'a> {
    bytes: &'a [u8],
    code_table: &'a HashMap<Word, CodeData>,
    func_data: &'a HashMap<Word, Word>,
    code: Vec<Word>,
    map: HashMap<u32, u32>,
    work: Vec<u32>,
    imm_fixups: Vec<(usize, u32)>,
    jump_maps: Vec<BTreeMap<Word, Word>>,
    map_fixups: Vec<(usize, Word, u32)>,
}

impl<'a> Translator<'a> {
    pub fn new(
        bytes: &'a [u8],
        code_table: &'a HashMap<Word, CodeData>,
        func_data: &'a HashMap<Word, Word>,
    ) -> Self {
        Translator {
            bytes,
            code_table,
            func_data,
            code: vec![Code::Kill as Word],
            map: HashMap::new(),
            work: Vec::new(),
            imm_fixups: Vec::new(),
            jump_maps: Vec::new(),
            map_fixups: Vec::new(),
        }
    }

    pub fn run(mut self, entries: &[u32]) -> Translated {
        for &e in entries {
            if e != 0 {
                self.work.push(e);
            }
        }
        while let Some(off) = self.work.pop() {
            self.decode_run(off);
        }
        for (pos, target) in std::mem::take(&mut self.imm_fixups) {
            self.code[pos] = self.map.get(&target).copied().unwrap_or(0);
        }
        for (mi, key, target) in std::mem::take(&mut self.map_fixups) {
            let idx = self.map.get(&target).copied().unwrap_or(0);
            self.jump_maps[mi].entry(key).or_insert(idx);
        }
        Translated { code: self.code, map: self.map, jump_maps: self.jump_maps }
    }

    fn emit(&mut self, w: Word) -> usize {
        self.code.push(w);
        self.code.len() - 1
    }

    fn read_u32(&self, off: u32) -> Option<u32> {
        let off = off as usize;
        if off + 4 > self.bytes.len() {
            return None;
        }
        Some(u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap()))
    }

    fn kill_at(&mut self, off: u32) {
        let idx = self.emit(Code::Kill as Word);
        self.map.insert(off, idx as u32);
    }

    fn decode_run(&mut self, mut off: u32) {
        loop {
            if self.map.contains_key(&off) {
                return;
            }
            let Some(op) = self.read_u32(off) else {
                self.kill_at(off);
                return;
            };
            let Some(data) = self.code_table.get(&op).copied() else {
                log::warn!("untranslatable opcode {op} at byte offset {off:#x}");
                self.kill_at(off);
                return;
            };

            if data.code == Code::Jtab {
                off = self.decode_case_run(off);
                continue;
            }

            if data.code == Code::CallFunc && data.func.is_none() {
                // (argc, funcId) in the stream; redirect through the
                // func-data table.
                let (Some(argc), Some(func_id)) = (self.read_u32(off + 4), self.read_u32(off + 8))
                else {
                    self.kill_at(off);
                    return;
                };
                match self.func_data.get(&func_id).copied() {
                    Some(cf) => {
                        let idx = self.emit(Code::CallFunc as Word);
                        self.map.insert(off, idx as u32);
                        self.emit(cf);
                        self.emit(argc);
                        off += 12;
                        continue;
                    }
                    None => {
                        log::warn!("unbound function id {func_id:#x} at byte offset {off:#x}");
                        self.kill_at(off);
                        return;
                    }
                }
            }

            if data.code == Code::CallFunc {
                let idx = self.emit(Code::CallFunc as Word);
                self.map.insert(off, idx as u32);
                let func = data.func.unwrap();
                self.emit(func);
                self.emit(data.argc);
                off += 4;
                continue;
            }

            let imms = data.source_imms();
            if self.read_u32(off + 4 * imms).is_none() && imms > 0 {
                self.kill_at(off);
                return;
            }
            let idx = self.emit(data.code as Word);
            self.map.insert(off, idx as u32);
            for i in 0..imms {
                let raw = self.read_u32(off + 4 + 4 * i).unwrap_or(0);
                let is_branch_imm = matches!(data.code, Code::Jump | Code::Jif | Code::Jifn);
                if is_branch_imm {
                    let pos = self.emit(raw);
                    self.imm_fixups.push((pos, raw));
                    self.work.push(raw);
                } else {
                    self.emit(raw);
                }
            }
            off += 4 + 4 * imms;
            if data.code.is_terminal() {
                return;
            }
        }
    }

    /// Collapse a run of consecutive case-goto records into one jump
    /// map. Each record is (opcode, value, target); the run falls
    /// through when no value matches.
    fn decode_case_run(&mut self, off: u32) -> u32 {
        let mi = self.jump_maps.len();
        self.jump_maps.push(BTreeMap::new());
        let idx = self.emit(Code::Jtab as Word);
        self.map.insert(off, idx as u32);
        self.emit(mi as Word);

        let mut cur = off;
        loop {
            let Some(op) = self.read_u32(cur) else { break };
            let Some(data) = self.code_table.get(&op) else { break };
            if data.code != Code::Jtab {
                break;
            }
            let (Some(value), Some(target)) = (self.read_u32(cur + 4), self.read_u32(cur + 8))
            else {
                break;
            };
            self.map_fixups.push((mi, value, target));
            self.work.push(target);
            cur += 12;
        }
        cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::default_code_table;

    fn words(ws: &[u32]) -> Vec<u8> {
        ws.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn linear_decode_and_branch_fixup() {
        // push 5; ifgoto 16 (byte offset of the terminate); terminate
        let bytes = words(&[3, 5, 53, 16, 1, 1]);
        let table = default_code_table();
        let funcs = HashMap::new();
        let t = Translator::new(&bytes, &table, &funcs).run(&[0]);
        let entry = t.resolve(0);
        assert_eq!(t.code[entry as usize], Code::PushLit as Word);
        assert_eq!(t.code[entry as usize + 1], 5);
        let jif_imm = t.code[entry as usize + 3];
        assert_eq!(t.code[jif_imm as usize], Code::Terminate as Word);
    }

    #[test]
    fn unknown_opcode_becomes_kill() {
        let bytes = words(&[9999, 1]);
        let table = default_code_table();
        let funcs = HashMap::new();
        let t = Translator::new(&bytes, &table, &funcs).run(&[0]);
        assert_eq!(t.code[t.resolve(0) as usize], Code::Kill as Word);
    }

    #[test]
    fn case_run_collapses_to_jump_map() {
        // casegoto (1 -> 40); casegoto (2 -> 40); drop; terminate
        // offset 40 holds the terminate.
        let bytes = words(&[84, 1, 40, 84, 2, 40, 54, 0, 0, 0, 1]);
        let table = default_code_table();
        let funcs = HashMap::new();
        let t = Translator::new(&bytes, &table, &funcs).run(&[0]);
        assert_eq!(t.jump_maps.len(), 1);
        let m = &t.jump_maps[0];
        assert_eq!(m.len(), 2);
        let target = *m.get(&1).unwrap();
        assert_eq!(t.code[target as usize], Code::Terminate as Word);
        assert_eq!(m.get(&1), m.get(&2));
    }

    #[test]
    fn unresolved_branch_lands_on_reserved_kill() {
        let bytes = words(&[52, 0x999]);
        let table = default_code_table();
        let funcs = HashMap::new();
        let t = Translator::new(&bytes, &table, &funcs).run(&[0]);
        let entry = t.resolve(0);
        assert_eq!(t.code[entry as usize], Code::Jump as Word);
        // 0x999 is not word-aligned with any decoded instruction; the
        // immediate patches to the reserved Kill at 0... unless the
        // target accidentally decoded. It did not: offset 0x999 is past
        // the buffer.
        assert_eq!(t.code[entry as usize + 1], 0);
    }
}
