use clap::Parser as ClapParser;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use ahash::AHashMap;

use jolt_vm::backend::mangle;
use jolt_vm::class::{AccessFlags, ClassId, CodePointer, ConstantValue, FieldInfo, MethodInfo};
use jolt_vm::constant::Constant;
use jolt_vm::{
    AotModule, ClassTable, LoaderInit, Mode, ResolvedClass, Session, SessionConfig,
    SystemCollector,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Output mode of the session
    #[arg(long, value_enum, default_value = "dynamic")]
    mode: Mode,

    /// Save the ahead-of-time module here
    #[arg(long, help = "Path of the module file written in aot mode")]
    output: Option<PathBuf>,

    /// Load a saved module instead of building one
    #[arg(long, help = "Reload a module file into a fresh dynamic session")]
    reload: Option<PathBuf>,

    /// Print cache and emission statistics
    #[arg(long)]
    stats: bool,

    #[arg(long, default_value_t = 64, help = "Busy-wait iterations before yielding")]
    spin_limit: u32,

    #[arg(long, help = "Cell limit of the ahead-of-time module")]
    max_cells: Option<usize>,

    #[arg(long, default_value = "demo", help = "Name of the ahead-of-time module")]
    module: String,
}

/// A small class hierarchy with fake code addresses.
struct Demo {
    classes: Vec<ClassId>,
    circle: ClassId,
    symbols: AHashMap<String, usize>,
}

fn define_demo(table: &ClassTable) -> Demo {
    let mut next_code = 0x1000;
    let mut code = || {
        next_code += 0x10;
        CodePointer(next_code)
    };

    let object = table.define(
        ResolvedClass::new("java/lang/Object")
            .with_method(MethodInfo::new("hashCode", "()I").with_code(code()))
            .with_method(MethodInfo::new("toString", "()Ljava/lang/String;").with_code(code())),
    );
    let string = table.define(
        ResolvedClass::new("java/lang/String")
            .with_super(object)
            .with_access(AccessFlags::PUBLIC | AccessFlags::FINAL)
            .with_field(FieldInfo::new("value", "[B")),
    );
    let shape = table.define(
        ResolvedClass::new("demo/Shape")
            .with_super(object)
            .with_access(AccessFlags::PUBLIC | AccessFlags::ABSTRACT)
            .with_method(
                MethodInfo::new("area", "()D").with_access(AccessFlags::PUBLIC | AccessFlags::ABSTRACT),
            )
            .with_method(MethodInfo::new("describe", "()V").with_code(code())),
    );
    let circle = table.define(
        ResolvedClass::new("demo/Circle")
            .with_super(shape)
            .with_field(FieldInfo::new("radius", "D"))
            .with_field(FieldInfo::new("next", "Ldemo/Circle;"))
            .with_field(FieldInfo::new_static("COUNT", "I").with_constant(ConstantValue::Int(1)))
            .with_field(
                FieldInfo::new_static("NAME", "Ljava/lang/String;")
                    .with_constant(ConstantValue::String("circle".to_string())),
            )
            .with_method(MethodInfo::new("area", "()D").with_code(code()))
            .with_method(MethodInfo::new("finalize", "()V").with_empty_body())
            .with_constant_pool(12),
    );
    let unit = table.define(ResolvedClass::new("demo/Circle$Unit").with_super(circle));
    table.nest(circle, unit, AccessFlags::PUBLIC | AccessFlags::STATIC);

    let mut symbols = AHashMap::new();
    for class in table.all() {
        for method in &class.meta.methods {
            if let Some(code) = method.code {
                symbols.insert(mangle(class.name(), &method.name, &method.descriptor), code.0);
            }
        }
    }

    Demo {
        classes: vec![object, string, shape, circle, unit],
        circle,
        symbols,
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match &cli.reload {
        Some(path) => reload(&cli, path),
        None => build(&cli),
    };
    if let Err(err) = result {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn build(cli: &Cli) -> Result<(), String> {
    let table = Arc::new(ClassTable::new());
    let demo = define_demo(&table);

    let mut config = match cli.mode {
        Mode::Dynamic => SessionConfig::dynamic(),
        Mode::AheadOfTime => SessionConfig::ahead_of_time(&cli.module),
    };
    config.spin_limit = cli.spin_limit;
    config.max_cells = cli.max_cells;
    let session = Session::new(config, table.clone(), Arc::new(SystemCollector::unbounded()));

    for &id in &demo.classes {
        let class = table.get(id);
        let reference = session.class_ref(id).map_err(|e| e.to_string())?;
        let layout = session.layout(id);
        let vtable = session.vtable(id);
        println!(
            "{:<20} {reference:?} size={} statics={} vtable={}",
            class.name(),
            layout.instance_size,
            layout.static_size,
            vtable.len()
        );
        for field in &layout.fields {
            println!("    +{:<4} {}: {:?}", field.offset, field.name, field.ty);
        }
        for method in &class.meta.methods {
            if let Some(slot) = vtable.slot_of(&method.name, &method.descriptor) {
                println!("    [{slot}] {}{}", method.name, method.descriptor);
            }
        }
    }
    let name = session
        .constant(&Constant::String("circle"))
        .map_err(|e| e.to_string())?;
    println!("{:<20} {name:?}", "\"circle\"");

    let first = session.allocate_instance(demo.circle).map_err(|e| e.to_string())?;
    let second = session.allocate_instance(demo.circle).map_err(|e| e.to_string())?;
    if let Some(next) = session.field_offset(demo.circle, "next") {
        // SAFETY: `next` is a reference field of a live instance
        unsafe { (first.field_ptr(next) as *mut usize).write(second.addr()) };
    }
    let registered = session.register_object(first).map_err(|e| e.to_string())?;
    println!("{:<20} {registered:?}", "final object");

    let monitors = session.monitors();
    monitors.acquire(first.header()).map_err(|e| e.to_string())?;
    println!("lock state while held: {:?}", monitors.state(first.header()));
    monitors.release(first.header());

    if cli.mode == Mode::Dynamic {
        if let Some(slot) = session.vtable_slot(demo.circle, "area", "()D") {
            // SAFETY: dynamic instances carry a resident vtable
            let entry = unsafe { jolt_vm::vtable::dispatch(first, slot) };
            println!("Circle.area dispatches through slot {slot} to 0x{entry:x}");
        }
    }

    if cli.stats {
        println!("{}", session.stats());
    }

    if let Some(module) = session.teardown() {
        println!("module `{}`: {} cells, {} symbols", module.name, module.cells.len(), module.symbols.len());
        if let Some(path) = &cli.output {
            module.save(path).map_err(|e| e.to_string())?;
            println!("saved to {}", path.display());
        }
    }
    Ok(())
}

fn reload(cli: &Cli, path: &Path) -> Result<(), String> {
    let module = AotModule::load(path).map_err(|e| e.to_string())?;
    let table = Arc::new(ClassTable::new());
    let demo = define_demo(&table);

    let loaded = LoaderInit::new(&table)
        .with_resolver(|symbol| demo.symbols.get(symbol).copied())
        .run(&module)
        .map_err(|e| e.to_string())?;

    let mut config = SessionConfig::dynamic();
    config.spin_limit = cli.spin_limit;
    let session = Session::new(config, table.clone(), Arc::new(SystemCollector::unbounded()));
    session.adopt(loaded.clone());

    for &(id, _) in loaded.classes() {
        println!("{:<20} 0x{:x}", table.get(id).name(), table.get(id).address());
    }
    for (text, object) in loaded.strings() {
        println!("{:<20} {object:?}", format!("\"{text}\""));
    }
    println!(
        "module `{}`: {} cells, {} resident bytes",
        loaded.name,
        loaded.len(),
        loaded.resident_bytes()
    );
    if cli.stats {
        println!("{}", session.stats());
    }
    Ok(())
}
