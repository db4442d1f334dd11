//! Little-endian state stream helpers.
//!
//! The persistent-state format is opaque but self-describing enough to
//! round-trip losslessly; all integers are little-endian.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::module::ModuleName;
use crate::scope::{Array, DelayedStart, ScopePath};
use crate::thread::{CallFrame, Thread, ThreadState};

pub struct StateWriter<'a> {
    w: &'a mut dyn Write,
}

impl<'a> StateWriter<'a> {
    pub fn new(w: &'a mut dyn Write) -> Self {
        StateWriter { w }
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.w.write_u8(v)?;
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.w.write_u32::<LittleEndian>(v)?;
        Ok(())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.w.write_u64::<LittleEndian>(v)?;
        Ok(())
    }

    pub fn put_bool(&mut self, v: bool) -> Result<()> {
        self.put_u8(v as u8)
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.put_u32(v.len() as u32)?;
        self.w.write_all(v)?;
        Ok(())
    }

    pub fn put_words(&mut self, v: &[u32]) -> Result<()> {
        self.put_u32(v.len() as u32)?;
        for &word in v {
            self.put_u32(word)?;
        }
        Ok(())
    }
}

pub struct StateReader<'a> {
    r: &'a mut dyn Read,
}

impl<'a> StateReader<'a> {
    pub fn new(r: &'a mut dyn Read) -> Self {
        StateReader { r }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.r.read_u8()?)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(self.r.read_u32::<LittleEndian>()?)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(self.r.read_u64::<LittleEndian>()?)
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > 1 << 28 {
            return Err(Error::Read(format!("state blob too large: {len}")));
        }
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn get_words(&mut self) -> Result<Vec<u32>> {
        let len = self.get_u32()? as usize;
        if len > 1 << 26 {
            return Err(Error::Read(format!("state vector too large: {len}")));
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.get_u32()?);
        }
        Ok(out)
    }
}

const STATE_MAGIC: u32 = u32::from_le_bytes(*b"ACSS");
const STATE_VERSION: u32 = 1;

fn put_array(w: &mut StateWriter<'_>, a: &Array) -> Result<()> {
    w.put_u32(a.len() as u32)?;
    for (k, v) in a.iter() {
        w.put_u32(k)?;
        w.put_u32(v)?;
    }
    Ok(())
}

fn get_array(r: &mut StateReader<'_>) -> Result<Array> {
    let mut a = Array::default();
    let n = r.get_u32()?;
    for _ in 0..n {
        let k = r.get_u32()?;
        let v = r.get_u32()?;
        a.set(k, v);
    }
    Ok(a)
}

fn put_arrays(w: &mut StateWriter<'_>, arrs: &[Array]) -> Result<()> {
    w.put_u32(arrs.len() as u32)?;
    for a in arrs {
        put_array(w, a)?;
    }
    Ok(())
}

fn get_arrays(r: &mut StateReader<'_>) -> Result<Vec<Array>> {
    let n = r.get_u32()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(get_array(r)?);
    }
    Ok(out)
}

fn put_state(w: &mut StateWriter<'_>, state: ThreadState) -> Result<()> {
    let (tag, key) = match state {
        ThreadState::Inactive => (0u8, 0),
        ThreadState::Running => (1, 0),
        ThreadState::Stopped => (2, 0),
        ThreadState::Paused => (3, 0),
        ThreadState::WaitScrNum(n) => (4, n),
        ThreadState::WaitScrName(s) => (5, s),
        ThreadState::WaitTag(t) => (6, t),
    };
    w.put_u8(tag)?;
    w.put_u32(key)
}

fn get_state(r: &mut StateReader<'_>) -> Result<ThreadState> {
    let tag = r.get_u8()?;
    let key = r.get_u32()?;
    Ok(match tag {
        0 => ThreadState::Inactive,
        1 => ThreadState::Running,
        2 => ThreadState::Stopped,
        3 => ThreadState::Paused,
        4 => ThreadState::WaitScrNum(key),
        5 => ThreadState::WaitScrName(key),
        6 => ThreadState::WaitTag(key),
        other => return Err(Error::Read(format!("bad thread state tag {other}"))),
    })
}

fn put_thread(w: &mut StateWriter<'_>, t: &Thread) -> Result<()> {
    put_state(w, t.state)?;
    w.put_u32(t.code_ptr)?;
    w.put_u32(t.module as u32)?;
    w.put_u32(t.script as u32)?;
    w.put_u32(t.call_stk.len() as u32)?;
    for f in &t.call_stk {
        w.put_u32(f.ret)?;
        w.put_u32(f.module as u32)?;
        w.put_u32(f.prev_reg_base as u32)?;
        w.put_u32(f.prev_arr_base as u32)?;
        w.put_u32(f.reg_top as u32)?;
        w.put_u32(f.arr_top as u32)?;
        w.put_bool(f.has_return)?;
    }
    w.put_words(&t.data_stk)?;
    w.put_words(&t.loc_regs)?;
    put_arrays(w, &t.loc_arrs)?;
    w.put_u32(t.reg_base as u32)?;
    w.put_u32(t.arr_base as u32)?;
    w.put_bytes(&t.print_buf)?;
    w.put_u32(t.delay)?;
    w.put_u32(t.result)?;
    w.put_u32(t.mod_scope as u32)?;
    Ok(())
}

fn get_thread(
    r: &mut StateReader<'_>,
    path: ScopePath,
    mod_map: &[usize],
) -> Result<Thread> {
    let mut t = Thread::default();
    t.state = get_state(r)?;
    t.code_ptr = r.get_u32()?;
    t.module = remap(mod_map, r.get_u32()?)?;
    t.script = r.get_u32()? as usize;
    let frames = r.get_u32()? as usize;
    for _ in 0..frames {
        let ret = r.get_u32()?;
        let module = remap(mod_map, r.get_u32()?)?;
        let prev_reg_base = r.get_u32()? as usize;
        let prev_arr_base = r.get_u32()? as usize;
        let reg_top = r.get_u32()? as usize;
        let arr_top = r.get_u32()? as usize;
        let has_return = r.get_bool()?;
        t.call_stk.push(CallFrame {
            ret,
            module,
            prev_reg_base,
            prev_arr_base,
            reg_top,
            arr_top,
            has_return,
        });
    }
    t.data_stk = r.get_words()?;
    t.loc_regs = r.get_words()?;
    t.loc_arrs = get_arrays(r)?;
    t.reg_base = r.get_u32()? as usize;
    t.arr_base = r.get_u32()? as usize;
    t.print_buf = r.get_bytes()?;
    t.delay = r.get_u32()?;
    t.result = r.get_u32()?;
    t.mod_scope = r.get_u32()? as usize;
    t.path = path;
    Ok(t)
}

fn remap(mod_map: &[usize], saved: u32) -> Result<usize> {
    mod_map
        .get(saved as usize)
        .copied()
        .ok_or_else(|| Error::Read(format!("module index {saved} out of range")))
}

impl Environment {
    /// Serialize the string table, module identities, scope storage and
    /// every thread's execution state. Round-trips losslessly; string
    /// indices are preserved exactly.
    pub fn save_state(&self, out: &mut dyn Write) -> Result<()> {
        let mut w = StateWriter::new(out);
        w.put_u32(STATE_MAGIC)?;
        w.put_u32(STATE_VERSION)?;

        let module_refs = self.module_ref_counts();
        self.strings
            .save_state(&mut w, |i| module_refs.get(&i).copied().unwrap_or(0))?;

        w.put_u32(self.modules.len() as u32)?;
        for m in &self.modules {
            let name = m.name.as_ref().expect("module without a name");
            match &name.text {
                Some(t) => {
                    w.put_u8(1)?;
                    w.put_bytes(t)?;
                }
                None => w.put_u8(0)?,
            }
            w.put_u64(name.ptr as u64)?;
            w.put_u64(name.tag as u64)?;
        }

        w.put_u32(self.globals.len() as u32)?;
        for (&gid, g) in &self.globals {
            w.put_u32(gid)?;
            w.put_bool(g.active)?;
            w.put_words(&g.regs)?;
            put_arrays(&mut w, &g.arrs)?;
            w.put_u32(g.hubs.len() as u32)?;
            for (&hid, h) in &g.hubs {
                w.put_u32(hid)?;
                w.put_bool(h.active)?;
                w.put_words(&h.regs)?;
                put_arrays(&mut w, &h.arrs)?;
                w.put_u32(h.maps.len() as u32)?;
                for (&mid, m) in &h.maps {
                    w.put_u32(mid)?;
                    w.put_bool(m.active)?;
                    w.put_u32(m.modules.len() as u32)?;
                    for &module in &m.modules {
                        w.put_u32(module as u32)?;
                    }
                    for ms in &m.mod_scopes {
                        w.put_words(&ms.regs)?;
                        put_arrays(&mut w, &ms.arrs)?;
                    }
                    w.put_u32(m.threads.len() as u32)?;
                    for &tid in &m.threads {
                        put_thread(&mut w, &self.threads[tid])?;
                    }
                    w.put_u32(m.delayed.len() as u32)?;
                    for d in &m.delayed {
                        w.put_u32(d.module as u32)?;
                        w.put_u32(d.script as u32)?;
                        w.put_words(&d.args)?;
                        w.put_u32(d.delay)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Restore from a `save_state` stream. Scopes and threads are
    /// rebuilt from scratch; modules named by the stream are loaded if
    /// missing and their string slots re-resolved against the restored
    /// table (the `reset_strings` contract).
    pub fn load_state(&mut self, input: &mut dyn Read) -> Result<()> {
        let mut r = StateReader::new(input);
        if r.get_u32()? != STATE_MAGIC {
            return Err(Error::Read("not a saved state".into()));
        }
        if r.get_u32()? != STATE_VERSION {
            return Err(Error::Read("unsupported state version".into()));
        }

        // The table is replaced wholesale; every module's existing
        // references die with it.
        for m in self.modules.iter_mut() {
            m.strings_reffed = false;
        }
        self.strings.load_state(&mut r)?;

        self.globals.clear();
        self.threads.clear();
        self.free_threads.clear();
        self.running = None;

        let module_count = r.get_u32()? as usize;
        let mut mod_map = Vec::with_capacity(module_count);
        for _ in 0..module_count {
            let text = if r.get_u8()? != 0 { Some(r.get_bytes()?) } else { None };
            let ptr = r.get_u64()? as usize;
            let tag = r.get_u64()? as usize;
            let name = ModuleName {
                text: text.map(|t| t.into_boxed_slice()),
                ptr,
                tag,
            };
            mod_map.push(self.get_module(name)?);
        }
        for mid in 0..self.modules.len() {
            if self.modules[mid].loaded && !self.modules[mid].strings_reffed {
                let mut m = std::mem::take(&mut self.modules[mid]);
                m.reset_strings(&mut self.strings);
                self.modules[mid] = m;
            }
        }

        let global_count = r.get_u32()? as usize;
        for _ in 0..global_count {
            let gid = r.get_u32()?;
            let active = r.get_bool()?;
            let regs = r.get_words()?;
            let arrs = get_arrays(&mut r)?;
            {
                let g = self.get_global_scope(gid);
                g.active = active;
                g.regs = regs;
                g.arrs = arrs;
            }
            let hub_count = r.get_u32()? as usize;
            for _ in 0..hub_count {
                let hid = r.get_u32()?;
                let active = r.get_bool()?;
                let regs = r.get_words()?;
                let arrs = get_arrays(&mut r)?;
                let path_hub = ScopePath::new(gid, hid, 0);
                {
                    let h = self.get_hub_scope(path_hub);
                    h.active = active;
                    h.regs = regs;
                    h.arrs = arrs;
                }
                let map_count = r.get_u32()? as usize;
                for _ in 0..map_count {
                    let mapid = r.get_u32()?;
                    let path = ScopePath::new(gid, hid, mapid);
                    let active = r.get_bool()?;
                    self.get_map_scope(path).active = active;

                    let bound = r.get_u32()? as usize;
                    let mut bound_mids = Vec::with_capacity(bound);
                    for _ in 0..bound {
                        bound_mids.push(remap(&mod_map, r.get_u32()?)?);
                    }
                    for &mid in &bound_mids {
                        self.bind_module(path, mid);
                    }
                    // Binding resolves imports only against modules bound
                    // before the importer; an importer saved ahead of its
                    // exporter still has unresolved slots here.
                    self.add_module_finish(path)?;
                    for i in 0..bound {
                        let regs = r.get_words()?;
                        let arrs = get_arrays(&mut r)?;
                        let ms = &mut self.get_map_scope(path).mod_scopes[i];
                        ms.regs = regs;
                        ms.arrs = arrs;
                    }

                    let thread_count = r.get_u32()? as usize;
                    for _ in 0..thread_count {
                        let t = get_thread(&mut r, path, &mod_map)?;
                        let tid = self.threads.len();
                        self.threads.push(t);
                        self.get_map_scope(path).threads.push(tid);
                    }

                    let delayed_count = r.get_u32()? as usize;
                    for _ in 0..delayed_count {
                        let module = remap(&mod_map, r.get_u32()?)?;
                        let script = r.get_u32()? as usize;
                        let args = r.get_words()?;
                        let delay = r.get_u32()?;
                        self.get_map_scope(path).delayed.push_back(DelayedStart {
                            module,
                            script,
                            args,
                            delay,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
