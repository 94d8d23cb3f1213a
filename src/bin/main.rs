use clap::Parser;
use std::fs;
use std::process;

use peglift::*;

const SAMPLE_CFG: &str = "\
fn sample
a: jmp h
h: br x y
x: jmp z
y: jmp z
z: br h exit
exit: ret
";

#[derive(Parser, Debug)]
/// Lift a textual CFG description into a program expression graph
struct Args {
    /// Input CFG description (if not given, use a built-in sample)
    #[clap(short, long)]
    input: Option<String>,
    /// Dump the source CFG as DOT to stdout
    #[clap(long)]
    cfg_dot: bool,
    /// Write pegbbs.<fn>.dot and peg.<fn>.dot to the working directory
    #[clap(long)]
    dot_peg: bool,
    /// Draw condition nodes even when nothing selects on them
    #[clap(long)]
    dot_peg_draw_all_nodes: bool,
}

fn main() {
    let args = Args::parse();

    let text = match &args.input {
        Some(path) => fs::read_to_string(path).unwrap_or_else(|err| {
            eprintln!("cannot read {path}: {err}");
            process::exit(1);
        }),
        None => SAMPLE_CFG.to_string(),
    };

    let result = parse_cfg_text(&text).and_then(|ast| {
        let cfg = build_cfg(&ast)?;
        if args.cfg_dot {
            println!("{}", graph_to_dot(&cfg));
        }
        let config = LiftConfig {
            emit_dot: args.dot_peg,
            draw_all_nodes: args.dot_peg_draw_all_nodes,
        };
        lift_function(&cfg, &ast.name, &config)
    });

    match result {
        Ok(func) => {
            println!("fn {}", func.name());
            for block in func.blocks() {
                let data = func.block(block);
                match data.child {
                    Some(child) => {
                        println!("  {} <- {}", func.node(block).name, func.node(child).name)
                    }
                    None => println!("  {}", func.node(block).name),
                }
            }
        }
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    }
}
