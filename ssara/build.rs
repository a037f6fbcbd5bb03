use cfgrammar::yacc::YaccKind;
use lrlex::CTLexerBuilder;

fn main() {
    // The textual LIR parser is only used by tests, but generating it unconditionally keeps the
    // build script simple.
    CTLexerBuilder::new()
        .lrpar_config(|ctp| {
            ctp.yacckind(YaccKind::Grmtools)
                .grammar_in_src_dir("lir/lir.y")
                .unwrap()
        })
        .lexer_in_src_dir("lir/lir.l")
        .unwrap()
        .build()
        .unwrap();
}
