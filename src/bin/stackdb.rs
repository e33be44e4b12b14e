use std::path::PathBuf;

use structopt::StructOpt;

use stackdb::core_file::CoreHost;
use stackdb::proc::Process;
use stackdb::unwind::{Frame, VarValue};
use stackdb::{line, Options};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "stackdb",
    about = "Print symbolic stack traces for every thread of an ELF core dump."
)]
struct Args {
    /// Don't resolve source file/line information.
    #[structopt(long = "no-source")]
    no_source: bool,

    /// Show function argument values.
    #[structopt(short = "a", long = "args")]
    args: bool,

    /// Show local variable values.
    #[structopt(short = "l", long = "locals")]
    locals: bool,

    /// Use only kernel LWPs; skip user-thread enumeration.
    #[structopt(long = "no-thread-db")]
    no_thread_db: bool,

    /// Cap the number of frames per thread.
    #[structopt(long = "max-depth", default_value = "1024")]
    max_depth: usize,

    /// Prefix replacement applied when locating objects, as FROM=TO.
    /// May repeat; first match wins.
    #[structopt(long = "replace", number_of_values = 1)]
    replace: Vec<String>,

    /// The executable, for cores without a usable file table.
    #[structopt(long = "exe", parse(from_os_str))]
    exe: Option<PathBuf>,

    /// The core dump to examine.
    #[structopt(parse(from_os_str))]
    core: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::from_args();

    let mut path_replacements = Vec::new();
    for pair in &args.replace {
        match pair.split_once('=') {
            Some((from, to)) => path_replacements.push((from.to_string(), to.to_string())),
            None => return Err(format!("bad --replace spec (want FROM=TO): {}", pair).into()),
        }
    }
    let options = Options {
        no_source: args.no_source,
        do_args: args.args,
        do_locals: args.locals,
        no_thread_db: args.no_thread_db,
        path_replacements,
        max_depth: args.max_depth,
    };

    let host = CoreHost::open(&args.core)?;
    let process = Process::new(Box::new(host), options);
    process.load_objects(args.exe.as_deref());

    for stack in process.stacks() {
        println!("thread (LWP {}):", stack.tid);
        let mut index = 0;
        for frame in &stack.frames {
            for inlined in frame.inline_chain() {
                let name = inlined.name().unwrap_or_else(|| "??".to_string());
                println!("#{:<3} {:#018x} {} (inlined)", index, frame.scope_ip(), name);
                index += 1;
            }
            print_frame(&process, index, frame);
            index += 1;
        }
        println!();
    }
    Ok(())
}

fn print_frame(process: &Process, index: usize, frame: &Frame) {
    let mut line = format!("#{:<3} {:#018x} ", index, frame.raw_ip);

    match frame.function().and_then(|f| f.name()) {
        Some(name) => line.push_str(&name),
        None => match process.find_symbol(frame.scope_ip()) {
            Some((name, 0)) => line.push_str(&name),
            Some((name, off)) => line.push_str(&format!("{}+{:#x}", name, off)),
            None => line.push_str("??"),
        },
    }

    if process.options.do_args {
        let rendered: Vec<String> = frame
            .args(process)
            .iter()
            .map(render_variable)
            .collect();
        line.push_str(&format!("({})", rendered.join(", ")));
    }

    if let Some(obj) = &frame.object {
        let path = obj.info.image().path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        line.push_str(&format!(" in {}", name));
    }

    if !process.options.no_source {
        if let Some(source) = frame_source(frame) {
            line.push_str(&format!(" at {}:{}", source.file, source.line));
        }
    }

    line.push_str(&format!(" [{}]", frame.mechanism));
    println!("{}", line);

    if process.options.do_locals {
        for local in frame.locals(process) {
            println!("        {} = {}", local.name, render_value(&local));
        }
    }
}

fn frame_source(frame: &Frame) -> Option<line::SourceLine> {
    let obj = frame.object.as_ref()?;
    let func = frame.function()?;
    line::source_for(&obj.info, &func.unit, frame.object_ip()?)
}

fn render_variable(var: &VarValue) -> String {
    format!("{}={}", var.name, render_value(var))
}

fn render_value(var: &VarValue) -> String {
    match (var.value, var.in_register) {
        (Some(v), Some(reg)) => format!("{:#x} <r{}>", v, reg),
        (Some(v), None) => format!("{:#x}", v),
        _ => format!("<unavailable {}>", var.type_name),
    }
}
