use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::code::CodeData;
use crate::error::{Error, Result};
use crate::format::{self, LoadCtx};
use crate::interp::{self, Step};
use crate::module::{Module, ModuleId, ModuleName};
use crate::scope::{
    Array, GlobalScope, HubScope, MapScope, ModuleScope, ScopePath, SlotRef, DelayedStart,
};
use crate::script::{ScriptIdent, ScriptType};
use crate::string::{StringIdx, StringTable};
use crate::thread::{Thread, ThreadId, ThreadState};
use crate::Word;

/// A host-registered call-func. Returning `Ok(true)` makes the calling
/// thread yield for the rest of the tick.
pub type CallFunc = Rc<dyn Fn(&mut Environment, &mut Thread, &[Word]) -> Result<bool>>;

/// Host I/O capability: map a module name to its container bytes.
pub type ModuleLoader = Rc<dyn Fn(&ModuleName) -> std::io::Result<Vec<u8>>>;

/// Notification that a script terminated: (number, name).
pub type ScriptEndHook = Rc<dyn Fn(Word, Option<StringIdx>)>;

/// Diagnostic callback for contained runtime faults.
pub type ErrorHook = Rc<dyn Fn(&Error)>;

pub const DEFAULT_EXEC_BUDGET: u32 = 250_000;
pub const DEFAULT_SCRIPT_LOCALS: u32 = 20;

/// Owns every module, scope, string and thread; drives the tick.
pub struct Environment {
    pub strings: StringTable,
    pub(crate) modules: Vec<Module>,
    module_ids: HashMap<ModuleName, ModuleId>,
    loading: HashSet<ModuleId>,
    pub(crate) globals: BTreeMap<Word, GlobalScope>,
    pub(crate) threads: Vec<Thread>,
    pub(crate) free_threads: Vec<ThreadId>,
    pub(crate) call_funcs: Vec<CallFunc>,
    code_table: HashMap<Word, CodeData>,
    func_data: HashMap<Word, Word>,
    loader: Option<ModuleLoader>,
    script_end_hook: Option<ScriptEndHook>,
    error_hook: Option<ErrorHook>,
    /// Instruction budget per thread per tick; the only guard against
    /// runaway scripts.
    pub exec_budget: u32,
    /// Local register count for scripts without an SVCT override.
    pub script_locals_default: u32,
    /// Identity of the thread currently stepping, if any, and a state
    /// override requested for it mid-step (scriptStop on self).
    pub(crate) running: Option<(ThreadId, ModuleId, usize, ScopePath)>,
    pending_running_state: Option<ThreadState>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            strings: StringTable::new(),
            modules: Vec::new(),
            module_ids: HashMap::new(),
            loading: HashSet::new(),
            globals: BTreeMap::new(),
            threads: Vec::new(),
            free_threads: Vec::new(),
            call_funcs: Vec::new(),
            code_table: crate::code::default_code_table(),
            func_data: HashMap::new(),
            loader: None,
            script_end_hook: None,
            error_hook: None,
            exec_budget: DEFAULT_EXEC_BUDGET,
            script_locals_default: DEFAULT_SCRIPT_LOCALS,
            running: None,
            pending_running_state: None,
        }
    }

    // ---- registration -------------------------------------------------

    pub fn add_call_func(&mut self, f: CallFunc) -> Word {
        self.call_funcs.push(f);
        (self.call_funcs.len() - 1) as Word
    }

    /// Bind (or rebind) a source opcode number. Takes effect for
    /// modules loaded afterwards.
    pub fn add_code_data_acs0(&mut self, opcode: Word, data: CodeData) {
        self.code_table.insert(opcode, data);
    }

    /// Redirect a built-in function id to a registered call-func.
    pub fn add_func_data_acs0(&mut self, func_id: Word, call_func: Word) {
        self.func_data.insert(func_id, call_func);
    }

    pub fn set_module_loader(&mut self, loader: ModuleLoader) {
        self.loader = Some(loader);
    }

    pub fn set_script_end_hook(&mut self, hook: ScriptEndHook) {
        self.script_end_hook = Some(hook);
    }

    pub fn set_error_hook(&mut self, hook: ErrorHook) {
        self.error_hook = Some(hook);
    }

    /// Canonicalise a textual module reference.
    pub fn get_module_name(&self, text: &[u8]) -> ModuleName {
        ModuleName::text(text)
    }

    // ---- modules ------------------------------------------------------

    pub fn module(&self, mid: ModuleId) -> &Module {
        &self.modules[mid]
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Memoised module lookup; loads the body on first miss. The stub is
    /// registered before its body is read, so import cycles terminate.
    pub fn get_module(&mut self, name: ModuleName) -> Result<ModuleId> {
        if let Some(&mid) = self.module_ids.get(&name) {
            if self.modules[mid].loaded || self.loading.contains(&mid) {
                return Ok(mid);
            }
            self.load_module(mid)?;
            return Ok(mid);
        }
        let mid = self.modules.len();
        self.modules.push(Module::new(name.clone()));
        self.module_ids.insert(name, mid);
        self.load_module(mid)?;
        Ok(mid)
    }

    fn load_module(&mut self, mid: ModuleId) -> Result<()> {
        let loader = self
            .loader
            .clone()
            .ok_or_else(|| Error::Read("no module loader registered".into()))?;
        let name = self.modules[mid].name.clone().expect("module without a name");
        let bytes = loader(&name).map_err(|e| {
            Error::Read(format!("loading {:?}: {e}", name.text_lossy()))
        })?;
        self.read_bytecode(mid, &bytes)
    }

    /// Parse container bytes into an existing module stub and link its
    /// imports. On failure the module is left reset.
    pub fn read_bytecode(&mut self, mid: ModuleId, bytes: &[u8]) -> Result<()> {
        self.loading.insert(mid);
        let result = self.read_bytecode_inner(mid, bytes);
        self.loading.remove(&mid);
        if result.is_err() {
            let mut module = std::mem::take(&mut self.modules[mid]);
            module.reset(&mut self.strings);
            self.modules[mid] = module;
        }
        result
    }

    fn read_bytecode_inner(&mut self, mid: ModuleId, bytes: &[u8]) -> Result<()> {
        let mut module = std::mem::take(&mut self.modules[mid]);
        // Reload is reset-then-read; a second read of the same bytes
        // reproduces the first load exactly.
        module.reset(&mut self.strings);
        let mut ctx = LoadCtx {
            strings: &mut self.strings,
            code_table: &self.code_table,
            func_data: &self.func_data,
            script_locals_default: self.script_locals_default,
        };
        let import_names = match format::read_bytecode(&mut module, bytes, &mut ctx) {
            Ok(names) => names,
            Err(e) => {
                self.modules[mid] = module;
                return Err(e);
            }
        };
        for scr in module.scripts.iter_mut() {
            scr.module = mid;
        }
        for f in module.functions.iter_mut() {
            f.module = mid;
        }
        self.modules[mid] = module;

        let mut import_ids = Vec::with_capacity(import_names.len());
        for name in import_names {
            let name = self.get_module_name(&name);
            import_ids.push(self.get_module(name)?);
        }
        self.modules[mid].imports = import_ids;
        Ok(())
    }

    pub fn collect_strings(&mut self) -> usize {
        self.strings.collect()
    }

    // ---- scopes -------------------------------------------------------

    pub fn get_global_scope(&mut self, id: Word) -> &mut GlobalScope {
        self.globals.entry(id).or_default()
    }

    pub fn get_hub_scope(&mut self, path: ScopePath) -> &mut HubScope {
        self.globals.entry(path.gbl).or_default().get_hub(path.hub)
    }

    pub fn get_map_scope(&mut self, path: ScopePath) -> &mut MapScope {
        self.globals.entry(path.gbl).or_default().get_hub(path.hub).get_map(path.map)
    }

    pub(crate) fn map_scope(&self, path: ScopePath) -> Option<&MapScope> {
        self.globals.get(&path.gbl)?.hubs.get(&path.hub)?.maps.get(&path.map)
    }

    /// Activate the whole chain global -> hub -> map.
    pub fn activate(&mut self, path: ScopePath) {
        let g = self.globals.entry(path.gbl).or_default();
        g.active = true;
        let h = g.get_hub(path.hub);
        h.active = true;
        h.get_map(path.map).active = true;
    }

    // ---- module registration into a map ------------------------------

    /// Bind a loaded module into a map: allocate its storage, apply
    /// initializers, resolve imports against previously added modules,
    /// and register its scripts. Idempotent per (map, module).
    pub fn add_module(&mut self, path: ScopePath, mid: ModuleId) -> Result<()> {
        if !self.bind_module(path, mid) {
            return Ok(());
        }
        let scope_idx = self.map_scope(path).unwrap().mod_scopes.len() - 1;
        self.apply_module_inits(path, mid, scope_idx);
        Ok(())
    }

    /// Storage allocation, import resolution and script registration,
    /// without initializers. State restore reuses this and then writes
    /// the saved values back. Returns false if already bound.
    pub(crate) fn bind_module(&mut self, path: ScopePath, mid: ModuleId) -> bool {
        let map = self
            .globals
            .entry(path.gbl)
            .or_default()
            .get_hub(path.hub)
            .get_map(path.map);
        if map.modules.contains(&mid) {
            return false;
        }
        let ms = build_binding(&self.modules, map, mid);
        let module = &self.modules[mid];
        for (sidx, scr) in module.scripts.iter().enumerate() {
            match scr.name {
                Some(name) => {
                    if map.by_name.insert(name, (mid, sidx)).is_some() {
                        log::warn!("duplicate named script in map, later registration wins");
                    }
                }
                None => {
                    if map.by_number.insert(scr.number, (mid, sidx)).is_some() {
                        log::warn!(
                            "duplicate script number {} in map, later registration wins",
                            scr.number as i32
                        );
                    }
                }
            }
        }
        map.modules.push(mid);
        map.mod_scopes.push(ms);
        true
    }

    /// MINI/AINI values, then the MSTR/ASTR/ATAG tags that convert
    /// module-local string indices into referenced environment indices.
    fn apply_module_inits(&mut self, path: ScopePath, mid: ModuleId, scope_idx: usize) {
        let module = &self.modules[mid];
        let Some(map) = self
            .globals
            .get_mut(&path.gbl)
            .and_then(|g| g.hubs.get_mut(&path.hub))
            .and_then(|h| h.maps.get_mut(&path.map))
        else {
            return;
        };
        let ms = &mut map.mod_scopes[scope_idx];

        for init in &module.reg_inits {
            for (k, &v) in init.vals.iter().enumerate() {
                let idx = init.first as usize + k;
                if let Some(cell) = ms.regs.get_mut(idx) {
                    *cell = v;
                }
            }
        }
        for &r in &module.str_regs {
            if let Some(cell) = ms.regs.get_mut(r as usize) {
                let env_idx = module.string(*cell).unwrap_or(crate::string::STR_NONE);
                *cell = env_idx;
                self.strings.add_ref(env_idx);
            }
        }

        for init in &module.arr_inits {
            if let Some(SlotRef::Local(i)) = ms.arr_refs.get(init.arr as usize).copied() {
                if let Some(a) = ms.arrs.get_mut(i as usize) {
                    for (k, &v) in init.vals.iter().enumerate() {
                        a.set(k as Word, v);
                    }
                }
            }
        }
        for &arr in &module.str_arrs {
            if let Some(SlotRef::Local(i)) = ms.arr_refs.get(arr as usize).copied() {
                if let Some(a) = ms.arrs.get_mut(i as usize) {
                    let pairs: Vec<(Word, Word)> = a.iter().collect();
                    for (k, v) in pairs {
                        let env_idx = module.string(v).unwrap_or(crate::string::STR_NONE);
                        a.set(k, env_idx);
                        self.strings.add_ref(env_idx);
                    }
                }
            }
        }
        for (arr, tags) in &module.arr_tags {
            if let Some(SlotRef::Local(i)) = ms.arr_refs.get(*arr as usize).copied() {
                if let Some(a) = ms.arrs.get_mut(i as usize) {
                    for (k, &tag) in tags.iter().enumerate() {
                        if tag == 1 {
                            let v = a.get(k as Word);
                            let env_idx = module.string(v).unwrap_or(crate::string::STR_NONE);
                            a.set(k as Word, env_idx);
                            self.strings.add_ref(env_idx);
                        }
                    }
                }
            }
        }
    }

    /// Finish registration: retry unresolved imports now that every
    /// module is in, and fail if any remain.
    pub fn add_module_finish(&mut self, path: ScopePath) -> Result<()> {
        let Some(map) = self
            .globals
            .get_mut(&path.gbl)
            .and_then(|g| g.hubs.get_mut(&path.hub))
            .and_then(|h| h.maps.get_mut(&path.map))
        else {
            return Ok(());
        };

        let mut unresolved: Option<StringIdx> = None;
        for si in 0..map.mod_scopes.len() {
            let mid = map.modules[si];
            for kind in [true, false] {
                let refs_len = if kind {
                    map.mod_scopes[si].reg_refs.len()
                } else {
                    map.mod_scopes[si].arr_refs.len()
                };
                for ri in 0..refs_len {
                    let slot = if kind {
                        map.mod_scopes[si].reg_refs[ri]
                    } else {
                        map.mod_scopes[si].arr_refs[ri]
                    };
                    let SlotRef::Unresolved(name) = slot else { continue };
                    let resolved =
                        resolve_import(&self.modules, &map.modules, mid, name, kind);
                    match resolved {
                        Some(r) => {
                            if kind {
                                map.mod_scopes[si].reg_refs[ri] = r;
                            } else {
                                map.mod_scopes[si].arr_refs[ri] = r;
                            }
                        }
                        None => unresolved = Some(name),
                    }
                }
            }
        }
        if let Some(name) = unresolved {
            return Err(Error::UnresolvedImport {
                name: String::from_utf8_lossy(self.strings.bytes(name)).into_owned(),
            });
        }
        Ok(())
    }

    // ---- script control ----------------------------------------------

    fn resolve_script(&self, path: ScopePath, ident: ScriptIdent) -> Option<(ModuleId, usize)> {
        let map = self.map_scope(path)?;
        match ident {
            ScriptIdent::Num(n) => map.lookup_number(n),
            ScriptIdent::Name(s) => map.lookup_name(s),
        }
    }

    fn script_running(&self, path: ScopePath, mid: ModuleId, sidx: usize) -> bool {
        let Some(map) = self.map_scope(path) else { return false };
        let in_pool = map.threads.iter().any(|&tid| {
            let t = &self.threads[tid];
            t.is_live() && t.module == mid && t.script == sidx
        });
        in_pool
            || matches!(self.running, Some((_, rmid, rsidx, rpath))
                if rmid == mid && rsidx == sidx && rpath == path)
    }

    /// Start a script unless an instance is already live in this map.
    pub fn script_start(
        &mut self,
        path: ScopePath,
        ident: ScriptIdent,
        args: &[Word],
    ) -> Result<bool> {
        let Some((mid, sidx)) = self.resolve_script(path, ident) else {
            return Ok(false);
        };
        if self.script_running(path, mid, sidx) {
            return Ok(false);
        }
        self.spawn(path, mid, sidx, args);
        Ok(true)
    }

    /// Start a script regardless of live instances.
    pub fn script_start_forced(
        &mut self,
        path: ScopePath,
        ident: ScriptIdent,
        args: &[Word],
    ) -> Result<bool> {
        let Some((mid, sidx)) = self.resolve_script(path, ident) else {
            return Ok(false);
        };
        self.spawn(path, mid, sidx, args);
        Ok(true)
    }

    /// Start every script of the given type registered in the map.
    /// Returns how many were started.
    pub fn script_start_type(&mut self, path: ScopePath, stype: ScriptType, args: &[Word]) -> usize {
        let Some(map) = self.map_scope(path) else { return 0 };
        let mut targets = Vec::new();
        for &mid in &map.modules {
            for (sidx, scr) in self.modules[mid].scripts.iter().enumerate() {
                if scr.stype == stype {
                    targets.push((mid, sidx));
                }
            }
        }
        let count = targets.len();
        for (mid, sidx) in targets {
            self.spawn(path, mid, sidx, args);
        }
        count
    }

    /// Queue a script start after `delay` ticks.
    pub fn script_start_delayed(
        &mut self,
        path: ScopePath,
        ident: ScriptIdent,
        args: &[Word],
        delay: Word,
    ) -> Result<bool> {
        if delay == 0 {
            return self.script_start(path, ident, args);
        }
        let Some((mid, sidx)) = self.resolve_script(path, ident) else {
            return Ok(false);
        };
        self.get_map_scope(path).delayed.push_back(DelayedStart {
            module: mid,
            script: sidx,
            args: args.to_vec(),
            delay,
        });
        Ok(true)
    }

    fn spawn(&mut self, path: ScopePath, mid: ModuleId, sidx: usize, args: &[Word]) {
        let scr = &self.modules[mid].scripts[sidx];
        let (code_idx, regc, arrc, argc) =
            (scr.code_idx, scr.loc_reg_count, scr.loc_arr_count, scr.argc);
        let map = self.get_map_scope(path);
        let Some(mod_scope) = map.module_scope_index(mid) else {
            log::warn!("script start for a module not registered in this map");
            return;
        };
        let tid = match self.free_threads.pop() {
            Some(t) => t,
            None => {
                self.threads.push(Thread::default());
                self.threads.len() - 1
            }
        };
        self.threads[tid].start(mid, sidx, code_idx, regc, arrc, argc, args, path, mod_scope);
        self.get_map_scope(path).threads.push(tid);
    }

    /// Request termination of matching live scripts; observed at the
    /// next scheduling boundary.
    pub fn script_stop(&mut self, path: ScopePath, ident: ScriptIdent) {
        self.signal_threads(path, ident, ThreadState::Stopped);
    }

    pub fn script_pause(&mut self, path: ScopePath, ident: ScriptIdent) {
        self.signal_threads(path, ident, ThreadState::Paused);
    }

    pub fn script_resume(&mut self, path: ScopePath, ident: ScriptIdent) {
        self.signal_threads(path, ident, ThreadState::Running);
    }

    fn signal_threads(&mut self, path: ScopePath, ident: ScriptIdent, to: ThreadState) {
        let Some((mid, sidx)) = self.resolve_script(path, ident) else { return };
        let Some(map) = self.map_scope(path) else { return };
        let tids: Vec<ThreadId> = map.threads.clone();
        for tid in tids {
            let t = &mut self.threads[tid];
            if !(t.is_live() && t.module == mid && t.script == sidx) {
                continue;
            }
            match to {
                ThreadState::Stopped => t.state = ThreadState::Stopped,
                ThreadState::Paused => {
                    if t.state == ThreadState::Running {
                        t.state = ThreadState::Paused;
                        t.delay = 0;
                    }
                }
                ThreadState::Running => {
                    if t.state == ThreadState::Paused && t.delay == 0 {
                        t.state = ThreadState::Running;
                    }
                }
                _ => {}
            }
        }
        if let Some((_, rmid, rsidx, rpath)) = self.running {
            if rmid == mid && rsidx == sidx && rpath == path {
                self.pending_running_state = Some(to);
            }
        }
    }

    /// Wake threads waiting on a host-defined tag.
    pub fn wake_tag(&mut self, path: ScopePath, tag: Word) {
        let Some(map) = self.map_scope(path) else { return };
        let tids: Vec<ThreadId> = map.threads.clone();
        for tid in tids {
            let t = &mut self.threads[tid];
            if t.state == ThreadState::WaitTag(tag) {
                t.state = ThreadState::Running;
            }
        }
    }

    // ---- the tick -----------------------------------------------------

    pub fn has_active_thread(&self) -> bool {
        if self.threads.iter().any(|t| t.is_live()) {
            return true;
        }
        self.globals.values().any(|g| {
            g.hubs.values().any(|h| h.maps.values().any(|m| !m.delayed.is_empty()))
        })
    }

    /// One tick: run every Running thread of every active scope chain to
    /// its next suspension point, then advance delays, the delayed-start
    /// queue, and wait states.
    pub fn exec(&mut self) {
        let mut paths = Vec::new();
        for (&gid, g) in &self.globals {
            if !g.active {
                continue;
            }
            for (&hid, h) in &g.hubs {
                if !h.active {
                    continue;
                }
                for (&mid, m) in &h.maps {
                    if m.active {
                        paths.push(ScopePath::new(gid, hid, mid));
                    }
                }
            }
        }

        for path in paths {
            // 1: run.
            let tids = self.get_map_scope(path).threads.clone();
            for tid in tids {
                match self.threads[tid].state {
                    ThreadState::Running => self.run_thread(tid),
                    ThreadState::Stopped => self.finish_thread(tid),
                    _ => {}
                }
            }

            // 2: delays.
            let tids = self.get_map_scope(path).threads.clone();
            for tid in tids {
                let t = &mut self.threads[tid];
                if t.state == ThreadState::Paused && t.delay > 0 {
                    t.delay -= 1;
                    if t.delay == 0 {
                        t.state = ThreadState::Running;
                    }
                }
            }

            // 3: delayed starts.
            let map = self.get_map_scope(path);
            for d in map.delayed.iter_mut() {
                d.delay = d.delay.saturating_sub(1);
            }
            let mut due = Vec::new();
            let mut rest = std::collections::VecDeque::new();
            while let Some(d) = map.delayed.pop_front() {
                if d.delay == 0 {
                    due.push(d);
                } else {
                    rest.push_back(d);
                }
            }
            map.delayed = rest;
            for d in due {
                self.spawn(path, d.module, d.script, &d.args);
            }

            // 4: wait resolution.
            let map = self.get_map_scope(path);
            let nums = std::mem::take(&mut map.finished_numbers);
            let names = std::mem::take(&mut map.finished_names);
            if nums.is_empty() && names.is_empty() {
                continue;
            }
            let tids = self.get_map_scope(path).threads.clone();
            for tid in tids {
                let t = &mut self.threads[tid];
                match t.state {
                    ThreadState::WaitScrNum(n) if nums.contains(&n) => {
                        t.state = ThreadState::Running;
                    }
                    ThreadState::WaitScrName(s) if names.contains(&s) => {
                        t.state = ThreadState::Running;
                    }
                    _ => {}
                }
            }
        }
    }

    fn run_thread(&mut self, tid: ThreadId) {
        let mut thread = std::mem::take(&mut self.threads[tid]);
        self.running = Some((tid, thread.module, thread.script, thread.path));
        self.pending_running_state = None;

        let budget = self.exec_budget;
        for _ in 0..budget {
            let step = interp::step(self, &mut thread);
            if let Some(st) = self.pending_running_state.take() {
                if st == ThreadState::Stopped || thread.state == ThreadState::Running {
                    thread.state = st;
                }
            }
            match step {
                Ok(Step::Continue) => {
                    if thread.state != ThreadState::Running {
                        break;
                    }
                }
                Ok(Step::Yield) => break,
                Ok(Step::Stop) => {
                    thread.state = ThreadState::Stopped;
                    break;
                }
                Err(e) => {
                    log::warn!("thread fault: {e}");
                    if let Some(hook) = self.error_hook.clone() {
                        hook(&e);
                    }
                    thread.state = ThreadState::Stopped;
                    break;
                }
            }
        }

        self.running = None;
        self.threads[tid] = thread;
        if self.threads[tid].state == ThreadState::Stopped {
            self.finish_thread(tid);
        }
    }

    /// Reclaim a terminated thread: queue wait wakeups, notify the host,
    /// clear it, and return it to the pool.
    fn finish_thread(&mut self, tid: ThreadId) {
        let (path, mid, sidx) = {
            let t = &self.threads[tid];
            (t.path, t.module, t.script)
        };
        let (number, name) = {
            let scr = &self.modules[mid].scripts[sidx];
            (scr.number, scr.name)
        };
        {
            let map = self.get_map_scope(path);
            match name {
                Some(n) => map.finished_names.push(n),
                None => map.finished_numbers.push(number),
            }
            map.threads.retain(|&x| x != tid);
        }
        if let Some(hook) = self.script_end_hook.clone() {
            hook(number, name);
        }
        self.threads[tid].stop();
        self.free_threads.push(tid);
    }

    // ---- internals shared with the interpreter ------------------------

    pub(crate) fn hub_regs_mut(&mut self, path: ScopePath) -> &mut Vec<Word> {
        &mut self.get_hub_scope(path).regs
    }

    pub(crate) fn hub_arrs_mut(&mut self, path: ScopePath) -> &mut Vec<Array> {
        &mut self.get_hub_scope(path).arrs
    }

    pub(crate) fn gbl_regs_mut(&mut self, gbl: Word) -> &mut Vec<Word> {
        &mut self.get_global_scope(gbl).regs
    }

    pub(crate) fn gbl_arrs_mut(&mut self, gbl: Word) -> &mut Vec<Array> {
        &mut self.get_global_scope(gbl).arrs
    }

    /// Threads attached to a map, in scheduling order.
    pub fn map_threads(&self, path: ScopePath) -> Vec<&Thread> {
        self.map_scope(path)
            .map(|m| m.threads.iter().map(|&tid| &self.threads[tid]).collect())
            .unwrap_or_default()
    }

    /// Read a module-scope register through its import binding.
    pub fn module_reg_get(&self, path: ScopePath, mid: ModuleId, reg: Word) -> Word {
        self.map_scope(path)
            .and_then(|m| m.module_scope_index(mid).map(|si| m.mod_reg_get(si, reg)))
            .unwrap_or(0)
    }

    /// Per-index count of references held by loaded modules, subtracted
    /// from saved refcounts (module reload restores them).
    pub(crate) fn module_ref_counts(&self) -> HashMap<StringIdx, u32> {
        let mut counts: HashMap<StringIdx, u32> = HashMap::new();
        for m in &self.modules {
            if m.strings_reffed {
                m.visit_strings(|s| *counts.entry(s).or_default() += 1);
            }
        }
        counts
    }
}

/// Allocate a module's storage in a map and resolve its imports against
/// the modules already registered there. No initializers are applied;
/// registration and state restore share this.
fn build_binding(modules: &[Module], map: &MapScope, mid: ModuleId) -> ModuleScope {
    let module = &modules[mid];
    let mut ms = ModuleScope {
        module: mid,
        regs: vec![0; module.reg_count as usize],
        arrs: vec![Array::default(); module.arr_sizes.len()],
        reg_refs: (0..module.reg_count).map(SlotRef::Local).collect(),
        arr_refs: (0..module.arr_sizes.len() as u32).map(SlotRef::Local).collect(),
    };
    for imp in &module.reg_imports {
        let slot = resolve_import(modules, &map.modules, mid, imp.name, true)
            .unwrap_or(SlotRef::Unresolved(imp.name));
        if let Some(r) = ms.reg_refs.get_mut(imp.idx as usize) {
            *r = slot;
        }
    }
    for imp in &module.arr_imports {
        let slot = resolve_import(modules, &map.modules, mid, imp.name, false)
            .unwrap_or(SlotRef::Unresolved(imp.name));
        if let Some(r) = ms.arr_refs.get_mut(imp.idx as usize) {
            *r = slot;
        }
    }
    ms
}

/// Find `name` among the exports of other modules registered in the
/// map. `reg` selects register versus array exports.
fn resolve_import(
    modules: &[Module],
    registered: &[ModuleId],
    importer: ModuleId,
    name: StringIdx,
    reg: bool,
) -> Option<SlotRef> {
    for (si, &mid) in registered.iter().enumerate() {
        if mid == importer {
            continue;
        }
        let exporter = &modules[mid];
        let names = if reg { &exporter.reg_names } else { &exporter.arr_names };
        if let Some(pos) = names.iter().position(|&n| n == name && n != crate::string::STR_NONE) {
            return Some(SlotRef::Import { scope: si, slot: pos as u32 });
        }
    }
    None
}
