use std::collections::HashMap;

use crate::Word;

/// Internal instruction set. `Module::code` stores these discriminants as
/// words with their immediates inline; the interpreter is one match over
/// the decoded variant per step.
///
/// Index 0 is `Kill` so that unresolved branch targets and untranslatable
/// opcodes all land on an instruction that terminates the thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Code {
    Kill = 0,
    Nop,
    Terminate,
    Restart,

    PushLit,
    Drop,
    Dup,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    AndBit,
    OrBit,
    XorBit,
    ShL,
    ShR,
    LAnd,
    LOr,
    LNot,
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,

    Jump,
    Jif,
    Jifn,
    Jtab,

    LocRegGet,
    LocRegSet,
    ModRegGet,
    ModRegSet,
    HubRegGet,
    HubRegSet,
    GblRegGet,
    GblRegSet,
    LocArrGet,
    LocArrSet,
    ModArrGet,
    ModArrSet,
    HubArrGet,
    HubArrSet,
    GblArrGet,
    GblArrSet,

    Call,
    Retn,
    Retv,
    CallFunc,

    Delay,
    DelayLit,
    WaitScr,
    WaitScrLit,
    WaitScrName,
    WaitTag,
    WaitTagLit,

    BeginPrint,
    PrintStr,
    PrintDec,
    PrintChr,

    SetResult,
}

// Order must match the discriminants above.
const CODES: &[Code] = &[
    Code::Kill,
    Code::Nop,
    Code::Terminate,
    Code::Restart,
    Code::PushLit,
    Code::Drop,
    Code::Dup,
    Code::Add,
    Code::Sub,
    Code::Mul,
    Code::Div,
    Code::Mod,
    Code::Neg,
    Code::AndBit,
    Code::OrBit,
    Code::XorBit,
    Code::ShL,
    Code::ShR,
    Code::LAnd,
    Code::LOr,
    Code::LNot,
    Code::CmpEq,
    Code::CmpNe,
    Code::CmpLt,
    Code::CmpLe,
    Code::CmpGt,
    Code::CmpGe,
    Code::Jump,
    Code::Jif,
    Code::Jifn,
    Code::Jtab,
    Code::LocRegGet,
    Code::LocRegSet,
    Code::ModRegGet,
    Code::ModRegSet,
    Code::HubRegGet,
    Code::HubRegSet,
    Code::GblRegGet,
    Code::GblRegSet,
    Code::LocArrGet,
    Code::LocArrSet,
    Code::ModArrGet,
    Code::ModArrSet,
    Code::HubArrGet,
    Code::HubArrSet,
    Code::GblArrGet,
    Code::GblArrSet,
    Code::Call,
    Code::Retn,
    Code::Retv,
    Code::CallFunc,
    Code::Delay,
    Code::DelayLit,
    Code::WaitScr,
    Code::WaitScrLit,
    Code::WaitScrName,
    Code::WaitTag,
    Code::WaitTagLit,
    Code::BeginPrint,
    Code::PrintStr,
    Code::PrintDec,
    Code::PrintChr,
    Code::SetResult,
];

impl Code {
    pub fn from_word(w: Word) -> Option<Code> {
        CODES.get(w as usize).copied()
    }

    /// How many immediate words follow this code in `Module::code`.
    pub fn imm_count(self) -> u32 {
        use Code::*;
        match self {
            PushLit | Jump | Jif | Jifn | Jtab | LocRegGet | LocRegSet | ModRegGet
            | ModRegSet | HubRegGet | HubRegSet | GblRegGet | GblRegSet | LocArrGet
            | LocArrSet | ModArrGet | ModArrSet | HubArrGet | HubArrSet | GblArrGet
            | GblArrSet | Call | DelayLit | WaitScrLit | WaitTagLit => 1,
            CallFunc => 2,
            _ => 0,
        }
    }

    /// Decode never continues linearly past these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Code::Kill | Code::Terminate | Code::Restart | Code::Jump | Code::Retn | Code::Retv
        )
    }
}

/// One entry of the opcode binding table: what a source opcode number
/// translates to.
///
/// For `Code::CallFunc` the meaning of the fields follows the
/// registration API: with `func` set, the opcode takes no stream
/// operands and always invokes that call-func with `argc` stack
/// arguments; with `func` unset, the opcode carries `(argc, funcId)` in
/// the stream and `funcId` is redirected through the func-data table.
#[derive(Clone, Copy, Debug)]
pub struct CodeData {
    pub code: Code,
    pub argc: Word,
    pub func: Option<Word>,
}

impl CodeData {
    pub fn plain(code: Code) -> Self {
        CodeData { code, argc: 0, func: None }
    }

    pub fn call_func(func: Word, argc: Word) -> Self {
        CodeData { code: Code::CallFunc, argc, func: Some(func) }
    }

    /// Stream words consumed after the opcode word.
    pub fn source_imms(&self) -> u32 {
        match self.code {
            Code::CallFunc => {
                if self.func.is_some() {
                    0
                } else {
                    2
                }
            }
            c => c.imm_count(),
        }
    }
}

/// The default source-opcode table. The classic numbering is used for
/// the ops it defines; the remainder sit in a contiguous block above it.
/// Hosts rebind entries with `Environment::add_code_data_acs0` when a
/// dialect numbers them differently.
pub fn default_code_table() -> HashMap<Word, CodeData> {
    use Code::*;
    let entries: &[(Word, Code)] = &[
        (0, Nop),
        (1, Terminate),
        (3, PushLit),
        (14, Add),
        (15, Sub),
        (16, Mul),
        (17, Div),
        (18, Mod),
        (19, CmpEq),
        (20, CmpNe),
        (21, CmpLt),
        (22, CmpGt),
        (23, CmpLe),
        (24, CmpGe),
        (25, LocRegSet),
        (26, ModRegSet),
        (27, HubRegSet),
        (28, LocRegGet),
        (29, ModRegGet),
        (30, HubRegGet),
        (52, Jump),
        (53, Jif),
        (54, Drop),
        (55, Delay),
        (56, DelayLit),
        (61, WaitTag),
        (62, WaitTagLit),
        (69, Restart),
        (70, LAnd),
        (71, LOr),
        (72, AndBit),
        (73, OrBit),
        (74, XorBit),
        (75, LNot),
        (76, ShL),
        (77, ShR),
        (78, Neg),
        (79, Jifn),
        (81, WaitScr),
        (82, WaitScrLit),
        (85, BeginPrint),
        (87, PrintStr),
        (88, PrintDec),
        (89, PrintChr),
        (181, GblRegSet),
        (182, GblRegGet),
        (191, SetResult),
        (204, Call),
        (205, Retn),
        (206, Retv),
        (208, WaitScrName),
        (211, Dup),
        (213, ModArrGet),
        (214, ModArrSet),
        (215, HubArrGet),
        (216, HubArrSet),
        (217, GblArrGet),
        (218, GblArrSet),
        (219, LocArrGet),
        (220, LocArrSet),
    ];
    let mut table: HashMap<Word, CodeData> =
        entries.iter().map(|&(op, c)| (op, CodeData::plain(c))).collect();
    // 84: value/target pair; runs of these collapse into a jump map.
    table.insert(84, CodeData { code: Jtab, argc: 0, func: None });
    // 203: call-func with (argc, funcId) operands, redirected through the
    // func-data table.
    table.insert(203, CodeData { code: CallFunc, argc: 0, func: None });
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminant_table_agrees() {
        for (i, &c) in CODES.iter().enumerate() {
            assert_eq!(c as usize, i);
            assert_eq!(Code::from_word(i as Word), Some(c));
        }
        assert_eq!(Code::from_word(CODES.len() as Word), None);
    }

    #[test]
    fn default_table_is_self_consistent() {
        let t = default_code_table();
        assert_eq!(t[&0].code, Code::Nop);
        assert_eq!(t[&3].source_imms(), 1);
        assert_eq!(t[&203].source_imms(), 2);
        assert_eq!(CodeData::call_func(7, 0).source_imms(), 0);
    }
}
