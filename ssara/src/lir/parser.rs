//! A LIR parser, suitable for creating [Lir]s for testing purposes.
//!
//! The input format is close to the output of [Lir::display]:
//!
//! ```text
//! bb0 -> bb1(%0), bb2(3):
//!   def out(%0: i64)
//!   br [call, safepoint] in(%0), in(rax), in(@2, stack)
//! ```
//!
//! with the following differences:
//!
//! 1. Instructions are not numbered.
//! 2. Variables must be annotated with their [Kind] exactly once, either where they are defined
//!    or, for phi outputs, in the block header: `bb1(%1: i64, %2: ref):`. Variables must be
//!    numbered densely from `%0`.
//! 3. Blocks must be named `bb0`, `bb1`, ... in order.

use super::{BlockIdx, Inst, Kind, Lir, LirBuilder, Operand, Role, Value, VarIdx};
use crate::{frame::SlotIdx, target::RegisterCatalog};
use lrlex::{DefaultLexerTypes, LRNonStreamingLexer, lrlex_mod};
use lrpar::{NonStreamingLexer, Span, lrpar_mod};
use std::collections::HashMap;

lrlex_mod!("lir/lir.l");
lrpar_mod!("lir/lir.y");
type StorageT = u32;

struct LirParser<'lexer, 'input: 'lexer> {
    lexer: &'lexer LRNonStreamingLexer<'lexer, 'input, DefaultLexerTypes<StorageT>>,
    cat: &'lexer RegisterCatalog,
}

impl<'lexer, 'input: 'lexer> LirParser<'lexer, 'input> {
    fn build(self, astblocks: Vec<AstBlock>) -> Lir {
        for (i, blk) in astblocks.iter().enumerate() {
            if self.p_block(blk.name).index() != i {
                self.err_span(blk.name, &format!("Block should be named 'bb{i}'"));
            }
        }

        // Variables may be used before the instruction that defines them (e.g. across a loop's
        // back edge), so gather kinds before building anything.
        let mut kinds = HashMap::new();
        let mut note_kind = |var: Span, kind: Span| {
            let v = self.p_var(var);
            let k = self
                .lexer
                .span_str(kind)
                .parse::<Kind>()
                .unwrap_or_else(|_| self.err_span(kind, "Unknown kind"));
            if kinds.insert(v, k).is_some() {
                self.err_span(var, "Variable's kind given more than once");
            }
        };
        for blk in &astblocks {
            for (var, kind) in &blk.params {
                note_kind(*var, *kind);
            }
            for inst in &blk.insts {
                for op in &inst.operands {
                    if let AstValue::Var(var, Some(kind)) = op.value {
                        note_kind(var, kind);
                    }
                }
            }
        }

        let mut lb = LirBuilder::new();
        for i in 0..kinds.len() {
            let Some(kind) = kinds.get(&VarIdx::from_usize(i)) else {
                panic!("Variables must be numbered densely: %{i} has no kind");
            };
            lb.new_var(*kind);
        }
        for _ in &astblocks {
            lb.new_block();
        }

        for (i, blk) in astblocks.into_iter().enumerate() {
            let bidx = BlockIdx::from_usize(i);
            if !blk.params.is_empty() {
                lb.set_phis(
                    bidx,
                    blk.params.iter().map(|(var, _)| self.p_var(*var)).collect(),
                );
            }
            for inst in blk.insts {
                let inst = self.p_inst(inst, kinds.len());
                lb.push_inst(bidx, inst);
            }
            for succ in blk.succs {
                let args = succ
                    .args
                    .into_iter()
                    .map(|x| self.p_value(x, kinds.len()))
                    .collect();
                lb.add_edge(bidx, self.p_block(succ.name), args);
            }
        }

        lb.build().unwrap_or_else(|e| panic!("{e}"))
    }

    fn p_inst(&self, inst: AstInst, nvars: usize) -> Inst {
        let mut new = Inst::new(self.lexer.span_str(inst.name));
        for attr in inst.attrs {
            new = match self.lexer.span_str(attr) {
                "call" => new.with_call(),
                "safepoint" => new.with_safepoint(),
                _ => self.err_span(attr, "Unknown attribute"),
            };
        }
        for AstOperand { role, value, flag } in inst.operands {
            let role = match self.lexer.span_str(role) {
                "in" => Role::Input,
                "alive" => Role::Alive,
                "temp" => Role::Temp,
                "out" => Role::Output,
                "state" => Role::State,
                _ => self.err_span(role, "Unknown role"),
            };
            let mut op = Operand::new(role, self.p_value(value, nvars));
            if let Some(flag) = flag {
                if self.lexer.span_str(flag) != "stack" {
                    self.err_span(flag, "Unknown operand flag");
                }
                op = op.with_stack();
            }
            new = new.with_operand(op);
        }
        new
    }

    fn p_value(&self, value: AstValue, nvars: usize) -> Value {
        match value {
            AstValue::Var(span, _) => {
                let var = self.p_var(span);
                if var.index() >= nvars {
                    self.err_span(span, "Variable has no kind");
                }
                Value::Var(var)
            }
            AstValue::Const(span) => Value::Const(
                self.lexer
                    .span_str(span)
                    .parse::<i64>()
                    .unwrap_or_else(|e| self.err_span(span, &e.to_string())),
            ),
            AstValue::Reg(span) => Value::Reg(
                self.cat
                    .by_name(self.lexer.span_str(span))
                    .unwrap_or_else(|| self.err_span(span, "Unknown register")),
            ),
            AstValue::Slot(span) => Value::Stack(SlotIdx::from_usize(self.p_num(span, '@'))),
        }
    }

    fn p_block(&self, span: Span) -> BlockIdx {
        let s = self.lexer.span_str(span);
        assert!(s.starts_with("bb"));
        s[2..]
            .parse::<usize>()
            .map(BlockIdx::from_usize)
            .unwrap_or_else(|e| self.err_span(span, &e.to_string()))
    }

    fn p_var(&self, span: Span) -> VarIdx {
        VarIdx::from_usize(self.p_num(span, '%'))
    }

    /// Parse a number prefixed with `prefix`.
    fn p_num(&self, span: Span, prefix: char) -> usize {
        let s = self.lexer.span_str(span);
        assert_eq!(s.chars().nth(0).unwrap(), prefix);
        s[1..]
            .parse::<usize>()
            .unwrap_or_else(|e| self.err_span(span, &e.to_string()))
    }

    fn err_span(&self, span: Span, msg: &str) -> ! {
        let ((line_off, col), _) = self.lexer.line_col(span);
        let code = self
            .lexer
            .span_lines_str(span)
            .split('\n')
            .next()
            .unwrap()
            .trim();
        panic!("Line {line_off}, column {col}:\n  {code}\n{msg}");
    }
}

/// Parse the string `s` into a [Lir], resolving register names with `cat`.
///
/// # Panics
///
/// If `s` is not parsable or otherwise does not lead to the creation of a valid [Lir].
pub(crate) fn str_to_lir(cat: &RegisterCatalog, s: &str) -> Lir {
    let lexerdef = lir_l::lexerdef();
    let lexer = lexerdef.lexer(s);
    let (res, errs) = lir_y::parse(&lexer);
    if !errs.is_empty() {
        for e in errs {
            eprintln!("{}", e.pp(&lexer, &lir_y::token_epp));
        }
        panic!("Could not parse input");
    }

    let Some(Ok(blocks)) = res else {
        panic!("No AST produced")
    };

    LirParser { lexer: &lexer, cat }.build(blocks)
}

struct AstBlock {
    name: Span,
    /// Phi outputs: `(variable, kind)`.
    params: Vec<(Span, Span)>,
    succs: Vec<AstSucc>,
    insts: Vec<AstInst>,
}

struct AstSucc {
    name: Span,
    args: Vec<AstValue>,
}

struct AstInst {
    name: Span,
    attrs: Vec<Span>,
    operands: Vec<AstOperand>,
}

struct AstOperand {
    role: Span,
    value: AstValue,
    flag: Option<Span>,
}

#[derive(Clone, Copy)]
enum AstValue {
    /// A variable, optionally annotated with its kind.
    Var(Span, Option<Span>),
    Const(Span),
    Reg(Span),
    Slot(Span),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lir::Placement, target::test_catalog};

    #[test]
    fn simple() {
        let cat = test_catalog(2, 1);
        let lir = str_to_lir(
            &cat,
            "
          bb0 -> bb1(%0), bb2(-3):
            def [call, safepoint] out(%0: i64), temp(%1: f64), out(r1)
            br in(%0), in(@2, stack), state(7)
          bb1 -> bb2(%2):
            def out(%2: ref)
          bb2(%3: i64):
            ret in(%3)
        ",
        );
        assert_eq!(lir.blocks.len(), 3);
        assert_eq!(
            lir.vars.iter().copied().collect::<Vec<_>>(),
            vec![Kind::I64, Kind::F64, Kind::Ref, Kind::I64]
        );
        assert_eq!(lir.fixed_slots, 3);

        let bb0 = &lir.blocks[BlockIdx::from_usize(0)];
        assert_eq!(bb0.succs.len(), 2);
        let def = &bb0.insts[0];
        assert_eq!(def.name, "def");
        assert!(def.is_call);
        assert!(def.safepoint.is_some());
        assert_eq!(def.operands[1].role, Role::Temp);
        assert_eq!(
            def.operands[2].loc,
            Some(Placement::Reg(cat.by_name("r1").unwrap()))
        );
        let br = &bb0.insts[1];
        assert!(!br.is_call);
        assert!(br.operands[1].flags.allows_stack());
        assert!(!br.operands[0].flags.allows_stack());
        assert_eq!(br.operands[2].value, Value::Const(7));

        let phis = lir.blocks[BlockIdx::from_usize(2)].phis.as_ref().unwrap();
        assert_eq!(phis.outputs[0].value, Value::Var(VarIdx::from_usize(3)));
        assert_eq!(
            phis.inputs_from(BlockIdx::from_usize(0)).unwrap()[0].value,
            Value::Const(-3)
        );
        assert_eq!(
            phis.inputs_from(BlockIdx::from_usize(1)).unwrap()[0].value,
            Value::Var(VarIdx::from_usize(2))
        );
    }

    #[test]
    fn uses_before_defs() {
        let cat = test_catalog(2, 0);
        let lir = str_to_lir(
            &cat,
            "
          bb0 -> bb1:
            def out(%0: i64)
          bb1 -> bb2, bb3:
            br in(%0)
          bb2 -> bb1:
            use in(%1)
          bb3:
            def out(%1: i64)
        ",
        );
        assert_eq!(lir.num_vars(), 2);
        assert_eq!(lir.loops.len(), 1);
    }

    #[test]
    #[should_panic(expected = "Unknown register")]
    fn unknown_register() {
        str_to_lir(
            &test_catalog(2, 0),
            "
          bb0:
            ret in(rax)
        ",
        );
    }

    #[test]
    #[should_panic(expected = "%0 has no kind")]
    fn sparse_vars() {
        str_to_lir(
            &test_catalog(2, 0),
            "
          bb0:
            def out(%1: i64)
        ",
        );
    }

    #[test]
    #[should_panic(expected = "kind given more than once")]
    fn kind_twice() {
        str_to_lir(
            &test_catalog(2, 0),
            "
          bb0:
            def out(%0: i64)
            use in(%0: i64)
        ",
        );
    }

    #[test]
    #[should_panic(expected = "Unknown role")]
    fn unknown_role() {
        str_to_lir(
            &test_catalog(2, 0),
            "
          bb0:
            def outt(%0: i64)
        ",
        );
    }

    #[test]
    #[should_panic(expected = "Block should be named 'bb1'")]
    fn misnamed_block() {
        str_to_lir(
            &test_catalog(2, 0),
            "
          bb0 -> bb2:
            jmp
          bb2:
            ret
        ",
        );
    }

    #[test]
    #[should_panic(expected = "Could not parse input")]
    fn syntax_error() {
        str_to_lir(
            &test_catalog(2, 0),
            "
          bb0:
            def out(%0: i64
        ",
        );
    }
}
