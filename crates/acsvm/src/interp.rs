//! The opcode interpreter. One call to `step` executes one instruction
//! of one thread; the environment's tick loop drives it against the
//! per-thread budget.

use crate::code::Code;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::string::StringIdx;
use crate::thread::{Thread, ThreadState, CALL_STK_LIMIT, DATA_STK_LIMIT};
use crate::Word;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// Suspended for this tick (delay, wait, call-func yield).
    Yield,
    /// Terminated.
    Stop,
}

fn pop(t: &mut Thread) -> Result<Word> {
    t.data_stk.pop().ok_or(Error::StackUnderflow(t.code_ptr))
}

fn push(t: &mut Thread, v: Word) -> Result<()> {
    if t.data_stk.len() >= DATA_STK_LIMIT {
        return Err(Error::StackOverflow(t.code_ptr));
    }
    t.data_stk.push(v);
    Ok(())
}

/// Runtime string values are environment indices once tagged; direct
/// pushes in old bytecode are module-local indices. Local wins.
fn resolve_string(env: &Environment, t: &Thread, v: Word) -> StringIdx {
    env.modules[t.module].string(v).unwrap_or(v)
}

pub(crate) fn step(env: &mut Environment, t: &mut Thread) -> Result<Step> {
    let (code, imm0, imm1, next) = {
        let cv = &env.modules[t.module].code;
        let cp = t.code_ptr as usize;
        if cp >= cv.len() {
            return Err(Error::BadBranch(t.code_ptr));
        }
        let code = Code::from_word(cv[cp]).unwrap_or(Code::Kill);
        let imms = code.imm_count() as usize;
        if cp + 1 + imms > cv.len() {
            return Err(Error::BadBranch(t.code_ptr));
        }
        let imm0 = if imms >= 1 { cv[cp + 1] } else { 0 };
        let imm1 = if imms >= 2 { cv[cp + 2] } else { 0 };
        (code, imm0, imm1, (cp + 1 + imms) as u32)
    };

    let mut jump_to: Option<u32> = None;

    match code {
        Code::Kill => {
            log::warn!("thread hit untranslatable code at index {}", t.code_ptr);
            return Ok(Step::Stop);
        }
        Code::Nop => {}
        Code::Terminate => return Ok(Step::Stop),
        Code::Restart => {
            jump_to = Some(env.modules[t.module].scripts[t.script].code_idx);
        }

        Code::PushLit => push(t, imm0)?,
        Code::Drop => {
            pop(t)?;
        }
        Code::Dup => {
            let v = *t.data_stk.last().ok_or(Error::StackUnderflow(t.code_ptr))?;
            push(t, v)?;
        }

        Code::Add | Code::Sub | Code::Mul | Code::AndBit | Code::OrBit | Code::XorBit
        | Code::ShL | Code::ShR | Code::LAnd | Code::LOr | Code::CmpEq | Code::CmpNe
        | Code::CmpLt | Code::CmpLe | Code::CmpGt | Code::CmpGe => {
            let b = pop(t)?;
            let a = pop(t)?;
            let r = match code {
                Code::Add => a.wrapping_add(b),
                Code::Sub => a.wrapping_sub(b),
                Code::Mul => a.wrapping_mul(b),
                Code::AndBit => a & b,
                Code::OrBit => a | b,
                Code::XorBit => a ^ b,
                Code::ShL => a.wrapping_shl(b & 31),
                Code::ShR => ((a as i32) >> (b & 31)) as Word,
                Code::LAnd => (a != 0 && b != 0) as Word,
                Code::LOr => (a != 0 || b != 0) as Word,
                Code::CmpEq => (a == b) as Word,
                Code::CmpNe => (a != b) as Word,
                Code::CmpLt => ((a as i32) < (b as i32)) as Word,
                Code::CmpLe => ((a as i32) <= (b as i32)) as Word,
                Code::CmpGt => ((a as i32) > (b as i32)) as Word,
                Code::CmpGe => ((a as i32) >= (b as i32)) as Word,
                _ => unreachable!(),
            };
            push(t, r)?;
        }

        Code::Div | Code::Mod => {
            let b = pop(t)?;
            let a = pop(t)?;
            if b == 0 {
                return Err(Error::DivideByZero(t.code_ptr));
            }
            let r = match code {
                Code::Div => (a as i32).wrapping_div(b as i32) as Word,
                _ => (a as i32).wrapping_rem(b as i32) as Word,
            };
            push(t, r)?;
        }

        Code::Neg => {
            let v = pop(t)?;
            push(t, (v as i32).wrapping_neg() as Word)?;
        }
        Code::LNot => {
            let v = pop(t)?;
            push(t, (v == 0) as Word)?;
        }

        Code::Jump => jump_to = Some(imm0),
        Code::Jif => {
            if pop(t)? != 0 {
                jump_to = Some(imm0);
            }
        }
        Code::Jifn => {
            if pop(t)? == 0 {
                jump_to = Some(imm0);
            }
        }
        Code::Jtab => {
            let v = *t.data_stk.last().ok_or(Error::StackUnderflow(t.code_ptr))?;
            let target = env.modules[t.module]
                .jump_maps
                .get(imm0 as usize)
                .and_then(|m| m.get(&v))
                .copied();
            if let Some(target) = target {
                pop(t)?;
                jump_to = Some(target);
            }
        }

        Code::LocRegGet => {
            let v = t.loc_regs.get(t.reg_base + imm0 as usize).copied().unwrap_or(0);
            push(t, v)?;
        }
        Code::LocRegSet => {
            let v = pop(t)?;
            let idx = t.reg_base + imm0 as usize;
            if let Some(cell) = t.loc_regs.get_mut(idx) {
                *cell = v;
            }
        }
        Code::LocArrGet => {
            let idx = pop(t)?;
            let v = t
                .loc_arrs
                .get(t.arr_base + imm0 as usize)
                .map(|a| a.get(idx))
                .unwrap_or(0);
            push(t, v)?;
        }
        Code::LocArrSet => {
            let v = pop(t)?;
            let idx = pop(t)?;
            let slot = t.arr_base + imm0 as usize;
            if let Some(a) = t.loc_arrs.get_mut(slot) {
                a.set(idx, v);
            }
        }

        Code::ModRegGet => {
            let v = env
                .map_scope(t.path)
                .map(|m| m.mod_reg_get(t.mod_scope, imm0))
                .unwrap_or(0);
            push(t, v)?;
        }
        Code::ModRegSet => {
            let v = pop(t)?;
            let scope = t.mod_scope;
            env.get_map_scope(t.path).mod_reg_set(scope, imm0, v);
        }
        Code::ModArrGet => {
            let idx = pop(t)?;
            let v = env
                .map_scope(t.path)
                .map(|m| m.mod_arr_get(t.mod_scope, imm0, idx))
                .unwrap_or(0);
            push(t, v)?;
        }
        Code::ModArrSet => {
            let v = pop(t)?;
            let idx = pop(t)?;
            let scope = t.mod_scope;
            env.get_map_scope(t.path).mod_arr_set(scope, imm0, idx, v);
        }

        Code::HubRegGet => {
            let v = env.hub_regs_mut(t.path).get(imm0 as usize).copied().unwrap_or(0);
            push(t, v)?;
        }
        Code::HubRegSet => {
            let v = pop(t)?;
            if let Some(cell) = env.hub_regs_mut(t.path).get_mut(imm0 as usize) {
                *cell = v;
            }
        }
        Code::HubArrGet => {
            let idx = pop(t)?;
            let v = env
                .hub_arrs_mut(t.path)
                .get(imm0 as usize)
                .map(|a| a.get(idx))
                .unwrap_or(0);
            push(t, v)?;
        }
        Code::HubArrSet => {
            let v = pop(t)?;
            let idx = pop(t)?;
            if let Some(a) = env.hub_arrs_mut(t.path).get_mut(imm0 as usize) {
                a.set(idx, v);
            }
        }

        Code::GblRegGet => {
            let v = env.gbl_regs_mut(t.path.gbl).get(imm0 as usize).copied().unwrap_or(0);
            push(t, v)?;
        }
        Code::GblRegSet => {
            let v = pop(t)?;
            if let Some(cell) = env.gbl_regs_mut(t.path.gbl).get_mut(imm0 as usize) {
                *cell = v;
            }
        }
        Code::GblArrGet => {
            let idx = pop(t)?;
            let v = env
                .gbl_arrs_mut(t.path.gbl)
                .get(imm0 as usize)
                .map(|a| a.get(idx))
                .unwrap_or(0);
            push(t, v)?;
        }
        Code::GblArrSet => {
            let v = pop(t)?;
            let idx = pop(t)?;
            if let Some(a) = env.gbl_arrs_mut(t.path.gbl).get_mut(imm0 as usize) {
                a.set(idx, v);
            }
        }

        Code::Call => {
            let func = env.modules[t.module]
                .functions
                .get(imm0 as usize)
                .cloned()
                .ok_or(Error::BadCallFunc(imm0))?;
            if func.code_idx == 0 {
                return Err(Error::BadCallFunc(imm0));
            }
            if t.call_stk.len() >= CALL_STK_LIMIT {
                return Err(Error::StackOverflow(t.code_ptr));
            }
            let frame = crate::thread::CallFrame {
                ret: next,
                module: t.module,
                prev_reg_base: t.reg_base,
                prev_arr_base: t.arr_base,
                reg_top: t.loc_regs.len(),
                arr_top: t.loc_arrs.len(),
                has_return: func.has_return,
            };
            t.call_stk.push(frame);
            let new_base = t.loc_regs.len();
            t.loc_regs.resize(new_base + func.loc_reg_count as usize, 0);
            for i in (0..func.argc as usize).rev() {
                t.loc_regs[new_base + i] = pop(t)?;
            }
            let arr_new_base = t.loc_arrs.len();
            t.loc_arrs
                .resize(arr_new_base + func.loc_arr_count as usize, Default::default());
            t.reg_base = new_base;
            t.arr_base = arr_new_base;
            jump_to = Some(func.code_idx);
        }

        Code::Retn | Code::Retv => {
            let ret_val = if code == Code::Retv { Some(pop(t)?) } else { None };
            let Some(frame) = t.call_stk.pop() else {
                // A return at script level ends the script.
                return Ok(Step::Stop);
            };
            t.loc_regs.truncate(frame.reg_top);
            t.loc_arrs.truncate(frame.arr_top);
            t.reg_base = frame.prev_reg_base;
            t.arr_base = frame.prev_arr_base;
            t.module = frame.module;
            jump_to = Some(frame.ret);
            match ret_val {
                Some(v) => push(t, v)?,
                None if frame.has_return => push(t, 0)?,
                None => {}
            }
        }

        Code::CallFunc => {
            let argc = imm1 as usize;
            if t.data_stk.len() < argc {
                return Err(Error::StackUnderflow(t.code_ptr));
            }
            let split = t.data_stk.len() - argc;
            let args: Vec<Word> = t.data_stk.split_off(split);
            let f = env
                .call_funcs
                .get(imm0 as usize)
                .cloned()
                .ok_or(Error::BadCallFunc(imm0))?;
            // Advance before the call so the callee observes a
            // consistent thread (it may save state).
            t.code_ptr = next;
            let wants_yield = f(env, t, &args)?;
            if wants_yield {
                return Ok(Step::Yield);
            }
            return Ok(Step::Continue);
        }

        Code::Delay | Code::DelayLit => {
            let n = if code == Code::Delay { pop(t)? } else { imm0 };
            t.code_ptr = next;
            if n > 0 {
                t.delay = n;
                t.state = ThreadState::Paused;
                return Ok(Step::Yield);
            }
            return Ok(Step::Continue);
        }

        Code::WaitScr | Code::WaitScrLit => {
            let n = if code == Code::WaitScr { pop(t)? } else { imm0 };
            t.code_ptr = next;
            if script_number_live(env, t, n) {
                t.state = ThreadState::WaitScrNum(n);
                return Ok(Step::Yield);
            }
            return Ok(Step::Continue);
        }

        Code::WaitScrName => {
            let v = pop(t)?;
            let name = resolve_string(env, t, v);
            t.code_ptr = next;
            if script_name_live(env, t, name) {
                t.state = ThreadState::WaitScrName(name);
                return Ok(Step::Yield);
            }
            return Ok(Step::Continue);
        }

        Code::WaitTag | Code::WaitTagLit => {
            let tag = if code == Code::WaitTag { pop(t)? } else { imm0 };
            t.code_ptr = next;
            t.state = ThreadState::WaitTag(tag);
            return Ok(Step::Yield);
        }

        Code::BeginPrint => t.print_buf.clear(),
        Code::PrintStr => {
            let v = pop(t)?;
            let idx = resolve_string(env, t, v);
            let bytes = env.strings.bytes(idx).to_vec();
            t.print_buf.extend_from_slice(&bytes);
        }
        Code::PrintDec => {
            let v = pop(t)? as i32;
            t.print_buf.extend_from_slice(v.to_string().as_bytes());
        }
        Code::PrintChr => {
            let v = pop(t)?;
            t.print_buf.push(v as u8);
        }

        Code::SetResult => t.result = pop(t)?,
    }

    t.code_ptr = jump_to.unwrap_or(next);
    Ok(Step::Continue)
}

/// Is any live thread in this map running the numbered script?
fn script_number_live(env: &Environment, t: &Thread, number: Word) -> bool {
    let Some(map) = env.map_scope(t.path) else { return false };
    map.threads.iter().any(|&tid| {
        let th = &env.threads[tid];
        th.is_live() && {
            let scr = &env.modules[th.module].scripts[th.script];
            scr.name.is_none() && scr.number == number
        }
    })
}

fn script_name_live(env: &Environment, t: &Thread, name: StringIdx) -> bool {
    let Some(map) = env.map_scope(t.path) else { return false };
    map.threads.iter().any(|&tid| {
        let th = &env.threads[tid];
        th.is_live() && env.modules[th.module].scripts[th.script].name == Some(name)
    })
}
