use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use acsvm::{CodeData, Environment, ScopePath, ScriptType};

/// Load ACS modules and run their Open scripts until no thread is
/// active, one tick per 1/35 second.
#[derive(Debug, Parser)]
#[command(name = "acsvm-exec", version)]
struct Args {
    /// Bytecode module files, loaded in order.
    #[arg(required = true)]
    modules: Vec<PathBuf>,
}

const TICK_RATE: f64 = 1.0 / 35.0;

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut env = Environment::new();
    env.set_module_loader(Rc::new(|name| std::fs::read(name.text_lossy())));

    let timer = Rc::new(Cell::new(0u32));
    let need_test_save = Rc::new(Cell::new(false));

    let cf_end_print = env.add_call_func(Rc::new(|_env, thread, _args| {
        println!("{}", String::from_utf8_lossy(&thread.print_buf));
        thread.print_buf.clear();
        Ok(false)
    }));
    let cf_timer = {
        let timer = timer.clone();
        env.add_call_func(Rc::new(move |_env, thread, _args| {
            thread.data_stk.push(timer.get());
            Ok(false)
        }))
    };
    let cf_collect = env.add_call_func(Rc::new(|env, thread, _args| {
        let freed = env.collect_strings();
        thread.data_stk.push(freed as u32);
        Ok(false)
    }));
    let cf_dump_locals = env.add_call_func(Rc::new(|_env, thread, _args| {
        println!("LocReg base={} len={}", thread.reg_base, thread.loc_regs.len());
        for (i, v) in thread.loc_regs[thread.reg_base..].iter().enumerate() {
            println!("  [{i}]={v}");
        }
        Ok(false)
    }));
    let cf_test_save = {
        let need = need_test_save.clone();
        env.add_call_func(Rc::new(move |_env, _thread, _args| {
            need.set(true);
            Ok(false)
        }))
    };

    env.add_code_data_acs0(86, CodeData::call_func(cf_end_print, 0));
    env.add_code_data_acs0(93, CodeData::call_func(cf_timer, 0));
    env.add_code_data_acs0(270, CodeData::call_func(cf_end_print, 0));

    env.add_func_data_acs0(0x10000, cf_test_save);
    env.add_func_data_acs0(0x10001, cf_collect);
    env.add_func_data_acs0(0x10002, cf_dump_locals);

    let path = ScopePath::new(0, 0, 0);
    env.activate(path);

    let mut loaded = Vec::new();
    for file in &args.modules {
        let name = env.get_module_name(file.to_string_lossy().as_bytes());
        let module = env
            .get_module(name)
            .with_context(|| format!("error loading module {}", file.display()))?;
        loaded.push(module);
    }
    for module in loaded {
        env.add_module(path, module)?;
    }
    env.add_module_finish(path)?;

    env.script_start_type(path, ScriptType::Open, &[]);

    while env.has_active_thread() {
        let deadline = Instant::now() + Duration::from_secs_f64(TICK_RATE);

        timer.set(timer.get() + 1);
        env.exec();

        if need_test_save.take() {
            let mut buf = Vec::new();
            env.save_state(&mut buf).context("saving state")?;
            env.load_state(&mut buf.as_slice()).context("restoring state")?;
        }

        if let Some(rest) = deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(rest);
        }
    }

    Ok(())
}
