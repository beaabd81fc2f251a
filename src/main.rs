use anyhow::{Context, bail};
use std::fs;
use stencilflow::symbolics::{Dimension, Equation, Expr, Function};
use stencilflow::{DeviceBackend, OptLevel, Operator, RawOptions};
use tracing_subscriber::EnvFilter;

struct Args {
    options: Option<String>,
    backend: DeviceBackend,
    mode: OptLevel,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args { options: None, backend: DeviceBackend::default(), mode: OptLevel::Adv };
    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        let value = it.next().with_context(|| format!("missing value for {flag}"))?;
        match flag.as_str() {
            "--options" => args.options = Some(value),
            "--backend" => args.backend = DeviceBackend::parse(&value)?,
            "--mode" => args.mode = OptLevel::parse(&value),
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(args)
}

/// u[t+1] = u[t] + dt * (u_xx + u_yy), second order in space.
fn diffusion() -> Vec<Equation> {
    let time = Dimension::time("time");
    let t = Dimension::stepping("t", &time);
    let x = Dimension::space("x");
    let y = Dimension::space("y");
    let u = Function::time_dense("u", vec![t.clone(), x.clone(), y.clone()], 2);
    let dt = time.spacing().map(|s| s.expr()).unwrap_or(Expr::Int(1));

    let here = u.apply([t.expr(), x.expr(), y.expr()]);
    let laplace = Expr::deriv(here.clone(), x.clone(), 2) + Expr::deriv(here.clone(), y.clone(), 2);
    vec![Equation::new(u.apply([t.expr() + 1, x.expr(), y.expr()]), here + dt * laplace)]
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;

    println!("1. Загрузка опций...");
    let options = match &args.options {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            RawOptions::from_json(&text)?
        }
        None => RawOptions::new(),
    };

    println!(
        "2. Компиляция оператора (mode = {:?}, backend = {:?})...",
        args.mode, args.backend
    );
    let op = Operator::builder("diffusion", diffusion())
        .with_options(options)
        .with_mode(args.mode)
        .with_backend(args.backend)
        .build()?;

    println!("--- Граф ---");
    print!("{}", op.graph);
    println!("--- Опции ---");
    println!("{}", serde_json::to_string_pretty(&op.options)?);
    Ok(())
}
