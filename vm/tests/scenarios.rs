use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use jolt_vm::backend::StringObject;
use jolt_vm::class::{AccessFlags, ClassId, CodePointer, ConstantValue, FieldInfo, MethodInfo};
use jolt_vm::constant::{ConstantKind, Constant};
use jolt_vm::image::ImageKind;
use jolt_vm::module::{Cell, loaded_object};
use jolt_vm::threading::spawn_managed;
use jolt_vm::{
    AotModule, CLASS_OFFSET, ClassTable, ConstRef, HEADER_SIZE, ImageError, LoaderInit, LockState,
    Mode, ResolvedClass, RuntimeError, Session, SessionConfig, SystemCollector,
};

fn session_with(mode: Mode, table: Arc<ClassTable>) -> Session {
    let config = match mode {
        Mode::Dynamic => SessionConfig::dynamic(),
        Mode::AheadOfTime => SessionConfig::ahead_of_time("scenarios"),
    };
    Session::new(config, table, Arc::new(SystemCollector::unbounded()))
}

/// `A <- B <- C`, with a string constant on `A`.
fn chain(table: &ClassTable) -> (ClassId, ClassId, ClassId) {
    let a = table.define(
        ResolvedClass::new("A")
            .with_field(FieldInfo::new("x", "I"))
            .with_field(
                FieldInfo::new_static("GREETING", "Ljava/lang/String;")
                    .with_constant(ConstantValue::String("hello".to_string())),
            ),
    );
    let b = table.define(ResolvedClass::new("B").with_super(a));
    let c = table.define(ResolvedClass::new("C").with_super(b));
    (a, b, c)
}

fn node_class(table: &ClassTable) -> ClassId {
    table.define(
        ResolvedClass::new("Node")
            .with_field(FieldInfo::new("value", "J"))
            .with_field(FieldInfo::new("next", "LNode;")),
    )
}

#[test]
fn overriding_method_keeps_its_slot() {
    let table = Arc::new(ClassTable::new());
    let base = table.define(
        ResolvedClass::new("Base").with_method(MethodInfo::new("m", "()V").with_code(CodePointer(0x100))),
    );
    let derived = table.define(
        ResolvedClass::new("Derived")
            .with_super(base)
            .with_method(MethodInfo::new("m", "()V").with_code(CodePointer(0x200)))
            .with_method(MethodInfo::new("n", "()V").with_code(CodePointer(0x300))),
    );
    let session = session_with(Mode::Dynamic, table);

    let base_m = session.vtable_slot(base, "m", "()V").unwrap();
    assert_eq!(session.vtable_slot(derived, "m", "()V"), Some(base_m));
    assert_eq!(session.vtable_slot(derived, "n", "()V"), Some(base_m + 1));
    assert_eq!(
        session.method_offset(derived, "n", "()V").unwrap() - session.method_offset(base, "m", "()V").unwrap(),
        size_of::<usize>()
    );

    let obj = session.allocate_instance(derived).unwrap();
    assert_eq!(unsafe { jolt_vm::vtable::dispatch(obj, base_m) }, 0x200);
}

#[test]
fn contended_acquire_blocks_until_release() {
    let table = Arc::new(ClassTable::new());
    let node = node_class(&table);
    let session = Arc::new(session_with(Mode::Dynamic, table));
    let obj = session.allocate_instance(node).unwrap();

    session.monitors().acquire(obj.header()).unwrap();
    assert!(matches!(
        session.monitors().state(obj.header()),
        LockState::Thin { count: 1, .. }
    ));

    let acquired = Arc::new(AtomicBool::new(false));
    let contender = {
        let session = session.clone();
        let acquired = acquired.clone();
        spawn_managed(move || {
            session.monitors().acquire(obj.header()).unwrap();
            acquired.store(true, Ordering::SeqCst);
            session.monitors().release(obj.header());
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst));
    session.monitors().release(obj.header());
    contender.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert!(!session.monitors().is_locked(obj.header()));
}

#[test]
fn recursion_overflow_inflates() {
    let table = Arc::new(ClassTable::new());
    let node = node_class(&table);
    let session = session_with(Mode::Dynamic, table);
    let obj = session.allocate_instance(node).unwrap();
    let monitors = session.monitors();

    for _ in 0..255 {
        monitors.acquire(obj.header()).unwrap();
    }
    assert!(matches!(monitors.state(obj.header()), LockState::Thin { count: 255, .. }));
    monitors.acquire(obj.header()).unwrap();
    assert!(matches!(monitors.state(obj.header()), LockState::Fat { .. }));
    assert!(monitors.holds_lock(obj.header()));

    for _ in 0..256 {
        monitors.release(obj.header());
    }
    assert!(!monitors.is_locked(obj.header()));
    assert_eq!(monitors.live(), 1);
    unsafe { session.reclaim_object(obj) };
    assert_eq!(monitors.live(), 0);
}

#[test]
fn equal_string_initializers_share_one_constant() {
    for mode in [Mode::Dynamic, Mode::AheadOfTime] {
        let table = Arc::new(ClassTable::new());
        let id = table.define(
            ResolvedClass::new("Greeter")
                .with_field(
                    FieldInfo::new_static("FIRST", "Ljava/lang/String;")
                        .with_constant(ConstantValue::String("hello".to_string())),
                )
                .with_field(
                    FieldInfo::new_static("SECOND", "Ljava/lang/String;")
                        .with_constant(ConstantValue::String("hello".to_string())),
                ),
        );
        let session = session_with(mode, table);
        let image = session.image(id).unwrap();
        let fields = &image.class_image().unwrap().fields;
        assert_eq!(fields.len(), 2);
        assert!(!fields[0].initial_value.is_null());
        assert_eq!(fields[0].initial_value, fields[1].initial_value);
        assert_eq!(
            fields[0].initial_value,
            session.constant(&Constant::String("hello")).unwrap()
        );
        assert_eq!(session.stats().constants_of(ConstantKind::String), 1);
    }
}

#[test]
fn reloaded_hierarchy_shares_one_ancestor() {
    let table = Arc::new(ClassTable::new());
    let (_, _, c) = chain(&table);
    let session = session_with(Mode::AheadOfTime, table);
    session.class_ref(c).unwrap();
    let module = session.teardown().unwrap();
    assert_eq!(module.manifest.classes.iter().filter(|(n, _)| n == "A").count(), 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.jolt");
    module.save(&path).unwrap();
    let reread = AotModule::load(&path).unwrap();
    assert_eq!(reread, module);

    let fresh = Arc::new(ClassTable::new());
    let (a, b, c) = chain(&fresh);
    let loaded = LoaderInit::new(&fresh).run(&reread).unwrap();
    assert_eq!(loaded.classes().len(), 3);

    let a_ref = ConstRef::address(fresh.get(a).address());
    for id in [b, c] {
        let class = fresh.get(id);
        let image = class.image().unwrap();
        assert_eq!(image.common.display[0], a_ref);
        assert_eq!(*image.common.display.last().unwrap(), ConstRef::address(class.address()));
    }
    assert_eq!(fresh.get(c).image().unwrap().common.super_class, ConstRef::address(fresh.get(b).address()));

    // static storage came back with the interned string in it
    let dynamic = session_with(Mode::Dynamic, fresh.clone());
    let offset = dynamic.field_offset(a, "GREETING").unwrap();
    let statics = fresh.get(a).static_instance();
    assert_ne!(statics, 0);
    let string = unsafe { ((statics + offset) as *const usize).read() };
    assert_eq!(unsafe { &*(string as *const StringObject) }.as_str(), "hello");
    let (text, object) = loaded.strings().next().unwrap();
    assert_eq!(text, "hello");
    assert_eq!(object.resident_addr(), Some(string));

    dynamic.adopt(loaded.clone());
    assert_eq!(dynamic.class_ref(a).unwrap(), a_ref);
    assert_eq!(dynamic.constant(&Constant::String("hello")).unwrap(), object);
}

#[test]
fn final_object_cycles_survive_reload() {
    let table = Arc::new(ClassTable::new());
    let node = node_class(&table);
    let session = session_with(Mode::AheadOfTime, table);
    let next = session.field_offset(node, "next").unwrap();
    let value = session.field_offset(node, "value").unwrap();

    let first = session.allocate_instance(node).unwrap();
    let second = session.allocate_instance(node).unwrap();
    unsafe {
        (first.field_ptr(value) as *mut i64).write(-7);
        (first.field_ptr(next) as *mut usize).write(second.addr());
        (second.field_ptr(next) as *mut usize).write(first.addr());
    }
    let handle = session.register_object(first).unwrap();
    assert_eq!(session.register_object(first).unwrap(), handle);
    assert_eq!(session.stats().constants_of(ConstantKind::FinalObject), 2);
    let module = session.teardown().unwrap();
    assert_eq!(
        module.cells.iter().filter(|c| matches!(c, Cell::Object { .. })).count(),
        2
    );

    let fresh = Arc::new(ClassTable::new());
    let node = node_class(&fresh);
    let loaded = LoaderInit::new(&fresh).run(&module).unwrap();
    let first = unsafe { loaded_object(loaded.resolve(handle).unwrap()) }.unwrap();
    assert_eq!(first.header().class(), fresh.get(node).address());
    unsafe {
        assert_eq!((first.field_ptr(value) as *const i64).read(), -7);
        let second = (first.field_ptr(next) as *const usize).read();
        assert_ne!(second, 0);
        assert_eq!(((second + next) as *const usize).read(), first.addr());
    }
}

#[test]
fn failed_build_rolls_back_every_entry() {
    let table = Arc::new(ClassTable::new());
    let (_, _, c) = chain(&table);
    let mut config = SessionConfig::ahead_of_time("small");
    config.max_cells = Some(3);
    let session = Session::new(config, table, Arc::new(SystemCollector::unbounded()));

    let err = session.class_ref(c).unwrap_err();
    assert!(matches!(err, RuntimeError::OutOfMemory(_)));
    let stats = session.stats();
    assert_eq!(stats.cells, 0);
    assert_eq!(stats.images, 0);
    assert!(stats.constants.iter().all(|(_, n)| *n == 0));

    session.constant(&Constant::Utf8("fits")).unwrap();
    assert_eq!(session.stats().cells, 1);
}

#[test]
fn exhausted_collector_rolls_back_static_storage() {
    let table = Arc::new(ClassTable::new());
    let (a, _, _) = chain(&table);
    let session = Session::new(
        SessionConfig::dynamic(),
        table.clone(),
        Arc::new(SystemCollector::new(0)),
    );

    let err = session.constant(&Constant::StaticInstance(a)).unwrap_err();
    assert!(matches!(err, RuntimeError::OutOfMemory(_)));
    assert_eq!(session.stats().constants_of(ConstantKind::StaticInstance), 0);
    assert_eq!(session.stats().constants_of(ConstantKind::Class), 0);
    assert_eq!(table.get(a).static_instance(), 0);
    assert!(session.allocate_instance(a).is_err());
}

#[test]
fn nested_classes_reference_each_other() {
    for mode in [Mode::Dynamic, Mode::AheadOfTime] {
        let table = Arc::new(ClassTable::new());
        let outer = table.define(ResolvedClass::new("Outer"));
        let inner = table.define(ResolvedClass::new("Outer$Inner"));
        table.nest(outer, inner, AccessFlags::PRIVATE | AccessFlags::STATIC);
        let session = session_with(mode, table);

        let outer_ref = session.class_ref(outer).unwrap();
        let inner_ref = session.class_ref(inner).unwrap();
        let outer_image = session.image(outer).unwrap();
        let inner_image = session.image(inner).unwrap();
        assert_eq!(outer_image.class_image().unwrap().inner, vec![inner_ref]);
        assert_eq!(inner_image.class_image().unwrap().outer, outer_ref);
        assert_eq!(
            inner_image.class_image().unwrap().inner_access,
            AccessFlags::PRIVATE | AccessFlags::STATIC
        );
    }
}

#[test]
fn every_object_shares_the_header_layout() {
    let table = Arc::new(ClassTable::new());
    let empty = table.define(ResolvedClass::new("Empty"));
    let node = node_class(&table);
    let session = session_with(Mode::Dynamic, table.clone());

    assert_eq!(session.layout(empty).instance_size, HEADER_SIZE);
    assert!(session.field_offset(node, "value").unwrap() >= HEADER_SIZE);

    for id in [empty, node] {
        let obj = session.allocate_instance(id).unwrap();
        let class = unsafe { (obj.field_ptr(CLASS_OFFSET) as *const usize).read() };
        assert_eq!(class, table.get(id).address());
        assert_eq!(session.monitors().state(obj.header()), LockState::Unlocked);
    }

    let array = session.allocate_array(node, 4).unwrap();
    assert_eq!(unsafe { array.array_header() }.length(), 4);
    let array_class = table.get(table.array_of(node));
    match &array_class.image().unwrap().kind {
        ImageKind::Array { element_size, .. } => assert_eq!(*element_size as usize, size_of::<usize>()),
        other => panic!("unexpected image {other:?}"),
    }
}

#[test]
fn concurrent_builds_agree_on_one_reference() {
    let table = Arc::new(ClassTable::new());
    let (_, _, c) = chain(&table);
    let session = Arc::new(session_with(Mode::Dynamic, table));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || {
                (
                    session.class_ref(c).unwrap(),
                    session.constant(&Constant::String("shared")).unwrap(),
                )
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(session.stats().constants_of(ConstantKind::String), 1);
}

#[test]
fn bad_magic_is_rejected() {
    let bytes = b"NOTJOLT\0\x01\0\0\0".to_vec();
    let err = AotModule::read_from(&mut bytes.as_slice()).unwrap_err();
    assert!(matches!(err, ImageError::BadMagic));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.jolt");
    std::fs::write(&path, b"JOLTAOT\0").unwrap();
    assert!(AotModule::load(&path).is_err());
}

#[test]
fn unresolved_code_symbols_fail_the_load() {
    let table = Arc::new(ClassTable::new());
    let id = table.define(
        ResolvedClass::new("Native")
            .with_method(MethodInfo::new("run", "()V").with_code(CodePointer(0x40))),
    );
    let session = session_with(Mode::AheadOfTime, table);
    session.class_ref(id).unwrap();
    let module = session.teardown().unwrap();

    let fresh = ClassTable::new();
    fresh.define(
        ResolvedClass::new("Native")
            .with_method(MethodInfo::new("run", "()V").with_code(CodePointer(0x40))),
    );
    let symbol = jolt_vm::backend::mangle("Native", "run", "()V");
    match LoaderInit::new(&fresh).run(&module) {
        Err(ImageError::UnresolvedSymbol(name)) => assert_eq!(name, symbol),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("load should fail"),
    }

    let loaded = LoaderInit::new(&fresh)
        .with_resolver(|name| (name == symbol).then_some(0x40))
        .run(&module);
    assert!(loaded.is_ok());
}

/// `Plain` has no code, `Native.run` needs a resolver.
fn plain_and_native(table: &ClassTable) -> (ClassId, ClassId) {
    let plain = table.define(
        ResolvedClass::new("Plain")
            .with_field(FieldInfo::new_static("COUNT", "I").with_constant(ConstantValue::Int(3))),
    );
    let native = table.define(
        ResolvedClass::new("Native")
            .with_method(MethodInfo::new("run", "()V").with_code(CodePointer(0x40))),
    );
    (plain, native)
}

#[test]
fn failed_load_publishes_no_class() {
    let table = Arc::new(ClassTable::new());
    let (plain, native) = plain_and_native(&table);
    let session = session_with(Mode::AheadOfTime, table);
    session.constant(&Constant::StaticInstance(plain)).unwrap();
    session.class_ref(native).unwrap();
    let module = session.teardown().unwrap();

    let fresh = ClassTable::new();
    let (plain, native) = plain_and_native(&fresh);
    let err = LoaderInit::new(&fresh).with_loader(0x99).run(&module).err();
    assert!(matches!(err, Some(ImageError::UnresolvedSymbol(_))));
    for id in [plain, native] {
        let class = fresh.get(id);
        assert!(class.image().is_none());
        assert_eq!(class.static_instance(), 0);
        assert_eq!(class.loader(), 0);
    }

    let symbol = jolt_vm::backend::mangle("Native", "run", "()V");
    let loaded = LoaderInit::new(&fresh)
        .with_loader(0x99)
        .with_resolver(|name| (name == symbol).then_some(0x40))
        .run(&module)
        .unwrap();
    assert_eq!(loaded.classes().len(), 2);
    for id in [plain, native] {
        assert!(fresh.get(id).image().is_some());
        assert_eq!(fresh.get(id).loader(), 0x99);
    }
    assert_ne!(fresh.get(plain).static_instance(), 0);

    // a second load of the same classes is refused before touching them
    let again = LoaderInit::new(&fresh)
        .with_resolver(|name| (name == symbol).then_some(0x40))
        .run(&module)
        .err();
    assert!(matches!(again, Some(ImageError::Malformed(_))));
}

#[test]
fn published_images_outlive_the_loaded_module_handle() {
    let table = Arc::new(ClassTable::new());
    let (plain, native) = plain_and_native(&table);
    let session = session_with(Mode::AheadOfTime, table);
    session.constant(&Constant::StaticInstance(plain)).unwrap();
    session.class_ref(native).unwrap();
    let module = session.teardown().unwrap();

    let fresh = Arc::new(ClassTable::new());
    let (plain, native) = plain_and_native(&fresh);
    let symbol = jolt_vm::backend::mangle("Native", "run", "()V");
    let loaded = LoaderInit::new(&fresh)
        .with_resolver(|name| (name == symbol).then_some(0x40))
        .run(&module)
        .unwrap();
    drop(loaded);

    let image = fresh.get(native).image().unwrap().clone();
    let class_image = image.class_image().unwrap();
    let vtable = class_image.vtable.resident_addr().unwrap();
    let slot = class_image.methods[0].vtable_slot.unwrap() as usize;
    let entry = unsafe { ((vtable + slot * jolt_vm::POINTER_SIZE) as *const usize).read() };
    let method = unsafe { &*(entry as *const jolt_vm::image::MethodImage) };
    assert_eq!(method.code, ConstRef::Function(0x40));

    let dynamic = session_with(Mode::Dynamic, fresh.clone());
    let offset = dynamic.field_offset(plain, "COUNT").unwrap();
    let statics = fresh.get(plain).static_instance();
    assert_eq!(unsafe { ((statics + offset) as *const i32).read() }, 3);
}
