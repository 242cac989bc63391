//! End-to-end tests: a detoured process talking to an in-process session.

use std::sync::{Arc, Mutex};
use uba_config::testing::TestEnvironment;
use uba_config::DetoursConfig;
use uba_detours::{
    CreationDisposition, DetoursOptions, Exists, FileState, MoveMethod, OsFunctions, ProbeResult,
    ProcessVirtualizationContext, Rules, ToolProfile,
};
use uba_ipc::win32::{GENERIC_READ, GENERIC_WRITE};
use uba_ipc::{to_string_key, Win32Error};
use uba_session::{InProcessTransport, SessionHandler};

fn options(env: &TestEnvironment, rules: Rules, allow_directory_cache: bool) -> DetoursOptions {
    DetoursOptions {
        shm_dir: env.shm_dir.clone(),
        rules,
        allow_directory_cache,
        memory_file_reserve: 1 << 20,
        directory_table_count: 64,
    }
}

fn process(transport: &InProcessTransport, options: DetoursOptions) -> ProcessVirtualizationContext {
    ProcessVirtualizationContext::new(options, Box::new(transport.clone()), Box::new(OsFunctions)).unwrap()
}

fn session(env: &TestEnvironment, setup: impl FnOnce(&mut SessionHandler)) -> InProcessTransport {
    let mut handler = SessionHandler::new(&env.config().session, false).unwrap();
    setup(&mut handler);
    InProcessTransport::new(Arc::new(Mutex::new(handler)))
}

fn read_all(ctx: &ProcessVirtualizationContext, path: &str) -> Vec<u8> {
    let handle = ctx
        .create_file(path, GENERIC_READ, CreationDisposition::OpenExisting, false)
        .unwrap();
    let mut content = vec![0u8; ctx.get_file_size(handle).unwrap() as usize];
    assert_eq!(ctx.read_file(handle, &mut content).unwrap(), content.len());
    ctx.close_handle(handle).unwrap();
    content
}

#[test]
fn test_new_file_becomes_visible_after_directory_update() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_disk_file("C:\\proj\\a.h", 10).unwrap();
        handler.preload_directory("C:\\proj").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::default(), true));

    let foo = "C:\\proj\\src\\foo.cpp";
    let rpcs = ctx.stats().rpc_calls();
    let calls = transport.call_count();
    let attributes = ctx.get_file_attributes(foo);
    assert!(!attributes.exists);
    assert_eq!(Win32Error(attributes.last_error), Win32Error::FILE_NOT_FOUND);
    assert!(attributes.use_cache);
    assert_eq!(ctx.stats().rpc_calls(), rpcs);
    assert_eq!(transport.call_count(), calls);

    transport
        .handler()
        .lock()
        .unwrap()
        .add_disk_file(foo, 42)
        .unwrap();
    // Nothing was parsed yet, so the stale answer stands.
    assert!(!ctx.get_file_attributes(foo).exists);

    let src = "C:\\proj\\src";
    assert!(ctx.rpc_update_directory(to_string_key(src), src).is_valid());
    let (exists, offset) = ctx.directory_table().entry_exists(to_string_key(foo), foo, false);
    assert_eq!(exists, Exists::Yes);
    let (info, name) = ctx.directory_table().get_entry_information(offset).unwrap();
    assert_eq!(info.size, 42);
    assert_eq!(name, "foo.cpp");

    let attributes = ctx.get_file_attributes(foo);
    assert!(attributes.exists);
    assert_eq!(attributes.info.size, 42);
}

#[test]
fn test_unknown_ancestor_costs_one_rpc() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_disk_file("C:\\lib\\x.h", 7).unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::default(), true));

    let calls = transport.call_count();
    let attributes = ctx.get_file_attributes("C:\\lib\\x.h");
    assert!(attributes.exists);
    assert_eq!(attributes.info.size, 7);
    assert_eq!(transport.call_count(), calls + 1);
    assert_eq!(ctx.stats().snapshot().entry_exists_maybe, 1);

    assert!(ctx.get_file_attributes("C:\\lib\\x.h").exists);
    assert!(!ctx.get_file_attributes("C:\\lib\\y.h").exists);
    assert_eq!(transport.call_count(), calls + 1);
}

#[test]
fn test_directory_with_trailing_separator_is_found() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_disk_file("C:\\proj\\src\\a.h", 1).unwrap();
        handler.preload_directory("C:\\proj").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::default(), true));

    let calls = transport.call_count();
    for path in ["C:\\proj\\src", "C:\\proj\\src\\", "C:\\proj\\src/"] {
        let attributes = ctx.get_file_attributes(path);
        assert!(attributes.exists, "{path}");
        assert!(attributes.info.is_directory());
        assert!(attributes.use_cache);
    }
    assert_eq!(transport.call_count(), calls);
}

#[test]
fn test_drive_root_is_a_directory() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |_| {});
    let ctx = process(&transport, options(&env, Rules::default(), true));

    let calls = transport.call_count();
    assert!(ctx.get_file_attributes("C:\\").info.is_directory());
    assert_eq!(transport.call_count(), calls);
}

#[test]
fn test_read_virtual_file_through_session_mapping() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler
            .add_virtual_files(&[
                ("C:\\proj\\a.h", b"#pragma once\n".as_slice()),
                ("C:\\proj\\b.h", b"int b;\n".as_slice()),
            ])
            .unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::default(), true));

    assert_eq!(read_all(&ctx, "C:\\proj\\b.h"), b"int b;\n");
    assert_eq!(read_all(&ctx, "C:\\proj\\a.h"), b"#pragma once\n");

    // Second open is answered from the file table.
    let calls = transport.call_count();
    let handle = ctx
        .create_file("C:\\proj\\a.h", GENERIC_READ, CreationDisposition::OpenExisting, false)
        .unwrap();
    assert_eq!(transport.call_count(), calls);
    assert_eq!(ctx.set_file_pointer(handle, -5, MoveMethod::End).unwrap(), 8);
    let mut tail = [0u8; 16];
    assert_eq!(ctx.read_file(handle, &mut tail).unwrap(), 5);
    assert_eq!(&tail[..5], b"once\n");
    assert_eq!(ctx.read_file(handle, &mut tail).unwrap(), 0);
    assert_eq!(
        ctx.set_file_pointer(handle, -100, MoveMethod::Current),
        Err(Win32Error::INVALID_PARAMETER)
    );
    assert_eq!(ctx.write_file(handle, b"x"), Err(Win32Error::ACCESS_DENIED));
    ctx.close_handle(handle).unwrap();
    assert_eq!(ctx.close_handle(handle), Err(Win32Error::INVALID_HANDLE));

    let mapping = ctx.create_file("C:\\proj\\b.h", GENERIC_READ, CreationDisposition::OpenExisting, false).unwrap();
    let section = ctx.create_file_mapping(mapping, 0, false).unwrap();
    let view = ctx.map_view_of_file(section, 4, 0).unwrap();
    assert_eq!(view.to_vec(), b"b;\n");
    assert_eq!(ctx.map_view_of_file(section, 1, u64::MAX).err(), Some(Win32Error::INVALID_PARAMETER));
    assert_eq!(ctx.map_view_of_file(section, 8, 0).err(), Some(Win32Error::INVALID_PARAMETER));
    ctx.close_handle(section).unwrap();
    ctx.close_handle(mapping).unwrap();
}

#[test]
fn test_missing_file_is_not_found() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_directory("C:\\proj").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::default(), true));

    assert_eq!(
        ctx.create_file("C:\\proj\\none.h", GENERIC_READ, CreationDisposition::OpenExisting, false)
            .err(),
        Some(Win32Error::FILE_NOT_FOUND)
    );
}

#[test]
fn test_attribute_only_open_tracks_file_state() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_disk_file("C:\\proj\\a.h", 3).unwrap();
        handler.preload_directory("C:\\proj").unwrap();
        handler.add_disk_file("C:\\lib\\x.h", 7).unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::default(), true));

    let a = "C:\\proj\\a.h";
    assert_eq!(ctx.file_state(a), FileState::Unknown);
    assert!(ctx.get_file_attributes(a).exists);
    assert_eq!(ctx.file_state(a), FileState::Probed(ProbeResult::FoundViaCache));
    assert!(!ctx.get_file_attributes("C:\\proj\\none.h").exists);
    assert_eq!(ctx.file_state("C:\\proj\\none.h"), FileState::Probed(ProbeResult::NotFound));
    assert!(ctx.get_file_attributes("C:\\lib\\x.h").exists);
    assert_eq!(ctx.file_state("C:\\lib\\x.h"), FileState::Probed(ProbeResult::FoundViaRpc));

    let handle = ctx.create_file(a, 0, CreationDisposition::OpenExisting, false).unwrap();
    assert_eq!(ctx.file_state(a), FileState::Opened);
    assert_eq!(ctx.get_file_information_by_handle(handle).unwrap().size, 3);
    assert_eq!(ctx.get_final_path_name(handle).unwrap(), a);

    // Probing an open file leaves it open; so does closing one of two handles.
    let duplicate = ctx.duplicate_handle(handle).unwrap();
    assert!(ctx.get_file_attributes(a).exists);
    assert_eq!(ctx.file_state(a), FileState::Opened);
    ctx.close_handle(handle).unwrap();
    assert_eq!(ctx.file_state(a), FileState::Opened);
    ctx.close_handle(duplicate).unwrap();
    assert_eq!(ctx.file_state(a), FileState::Closed);

    let dir = ctx
        .create_file("C:\\proj", 0, CreationDisposition::OpenExisting, false)
        .unwrap();
    assert!(ctx.get_file_information_by_handle(dir).unwrap().is_directory());
    ctx.close_handle(dir).unwrap();
}

#[test]
fn test_memory_output_is_published_to_other_processes() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_directory("C:\\proj\\out").unwrap();
        handler.preload_directory("C:\\proj\\out").unwrap();
    });
    let compiler = process(&transport, options(&env, Rules::new(ToolProfile::Msvc), true));

    let obj = "C:\\proj\\out\\foo.obj";
    let handle = compiler
        .create_file(obj, GENERIC_WRITE, CreationDisposition::CreateAlways, false)
        .unwrap();
    assert_eq!(compiler.write_file(handle, b"OBJECT").unwrap(), 6);
    assert_eq!(compiler.write_file(handle, b"-DATA").unwrap(), 5);
    assert_eq!(compiler.stats().snapshot().memory_files_created, 1);
    assert_eq!(compiler.get_file_attributes(obj).info.size, 11);
    assert_eq!(compiler.file_state(obj), FileState::MemoryBacked);
    compiler.close_handle(handle).unwrap();
    assert_eq!(compiler.file_state(obj), FileState::Closed);

    let memory_file = compiler.mapped_file_table().memory_file(&to_string_key(obj)).unwrap();
    assert!(memory_file.is_reported());

    // A second process sees the output through the shared file.
    let linker = process(&transport, options(&env, Rules::new(ToolProfile::Linker), true));
    let attributes = linker.get_file_attributes(obj);
    assert!(attributes.exists);
    assert_eq!(attributes.info.size, 11);
    assert_eq!(read_all(&linker, obj), b"OBJECT-DATA");

    let (first, entry) = linker.find_first_file("C:\\proj\\out\\*.obj").unwrap();
    assert_eq!(entry.name, "foo.obj");
    assert_eq!(linker.find_next_file(first), Err(Win32Error::NO_MORE_FILES));
    linker.find_close(first).unwrap();
}

#[test]
fn test_existing_memory_file_dispositions() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_directory("C:\\out").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::new(ToolProfile::Msvc), true));

    let obj = "C:\\out\\x.obj";
    assert_eq!(
        ctx.create_file(obj, GENERIC_WRITE, CreationDisposition::OpenExisting, false)
            .err(),
        Some(Win32Error::FILE_NOT_FOUND)
    );
    let handle = ctx.create_file(obj, GENERIC_WRITE, CreationDisposition::CreateNew, false).unwrap();
    ctx.write_file(handle, b"12345").unwrap();
    ctx.set_file_pointer(handle, 2, MoveMethod::Begin).unwrap();
    ctx.set_end_of_file(handle).unwrap();
    assert_eq!(ctx.get_file_size(handle).unwrap(), 2);

    let second = ctx.duplicate_handle(handle).unwrap();
    ctx.close_handle(handle).unwrap();
    assert!(!ctx.mapped_file_table().memory_file(&to_string_key(obj)).unwrap().is_reported());
    ctx.close_handle(second).unwrap();
    assert!(ctx.mapped_file_table().memory_file(&to_string_key(obj)).unwrap().is_reported());

    assert_eq!(
        ctx.create_file(obj, GENERIC_WRITE, CreationDisposition::CreateNew, false)
            .err(),
        Some(Win32Error::FILE_EXISTS)
    );
    let truncated = ctx
        .create_file(obj, GENERIC_WRITE, CreationDisposition::CreateAlways, false)
        .unwrap();
    assert_eq!(ctx.get_file_size(truncated).unwrap(), 0);
    ctx.close_handle(truncated).unwrap();
}

#[test]
fn test_listing_merges_memory_files_and_hides_deleted() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_virtual_file("C:\\proj\\a.h", b"a").unwrap();
        handler.add_virtual_file("C:\\proj\\b.cpp", b"b").unwrap();
        handler.add_virtual_file("C:\\proj\\c.cpp", b"c").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::new(ToolProfile::Msvc), true));

    let names = |pattern: &str| {
        let (handle, first) = ctx.find_first_file(pattern).unwrap();
        let mut names = vec![first.name];
        while let Ok(entry) = ctx.find_next_file(handle) {
            names.push(entry.name);
        }
        ctx.find_close(handle).unwrap();
        names
    };
    assert_eq!(names("C:\\proj\\*"), vec![".", "..", "a.h", "b.cpp", "c.cpp"]);

    let obj = ctx
        .create_file("C:\\proj\\d.obj", GENERIC_WRITE, CreationDisposition::CreateNew, false)
        .unwrap();
    ctx.delete_file("C:\\proj\\b.cpp").unwrap();
    assert_eq!(names("C:\\proj\\*.*"), vec![".", "..", "a.h", "c.cpp", "d.obj"]);
    assert_eq!(names("C:\\proj\\?.cpp"), vec!["c.cpp"]);
    ctx.close_handle(obj).unwrap();

    assert_eq!(
        ctx.find_first_file("C:\\proj\\*.rs").err(),
        Some(Win32Error::FILE_NOT_FOUND)
    );
    assert_eq!(
        ctx.find_first_file("C:\\nowhere\\*").err(),
        Some(Win32Error::PATH_NOT_FOUND)
    );
    assert_eq!(ctx.stats().snapshot().find_first_file_calls, 5);
}

#[test]
fn test_delete_hides_file_without_further_rpcs() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_virtual_file("C:\\proj\\a.h", b"a").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::default(), true));

    ctx.delete_file("C:\\proj\\a.h").unwrap();
    let calls = transport.call_count();
    assert!(!ctx.get_file_attributes("C:\\proj\\a.h").exists);
    assert_eq!(
        ctx.create_file("C:\\proj\\a.h", GENERIC_READ, CreationDisposition::OpenExisting, false)
            .err(),
        Some(Win32Error::FILE_NOT_FOUND)
    );
    assert_eq!(ctx.delete_file("C:\\proj\\a.h"), Err(Win32Error::FILE_NOT_FOUND));
    assert_eq!(transport.call_count(), calls);
}

#[test]
fn test_directory_operations_go_through_session() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_directory("C:\\proj").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::default(), true));

    ctx.create_directory("C:\\proj\\gen").unwrap();
    assert!(ctx.get_file_attributes("C:\\proj\\gen").info.is_directory());
    assert_eq!(ctx.create_directory("C:\\proj\\gen"), Err(Win32Error::ALREADY_EXISTS));
    ctx.remove_directory("C:\\proj\\gen").unwrap();
    assert!(!ctx.get_file_attributes("C:\\proj\\gen").exists);
}

#[test]
fn test_move_reported_output_updates_session() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_directory("C:\\out").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::new(ToolProfile::Msvc), true));

    let handle = ctx
        .create_file("C:\\out\\a.obj", GENERIC_WRITE, CreationDisposition::CreateNew, false)
        .unwrap();
    ctx.write_file(handle, b"abc").unwrap();
    ctx.close_handle(handle).unwrap();

    ctx.move_file("C:\\out\\a.obj", "C:\\out\\b.obj", 0).unwrap();
    assert!(!ctx.get_file_attributes("C:\\out\\a.obj").exists);
    assert_eq!(ctx.get_file_attributes("C:\\out\\b.obj").info.size, 3);

    let other = process(&transport, options(&env, Rules::default(), true));
    assert!(!other.get_file_attributes("C:\\out\\a.obj").exists);
    assert_eq!(read_all(&other, "C:\\out\\b.obj"), b"abc");
}

#[test]
fn test_local_memory_file_moves_without_rpc() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_directory("C:\\out").unwrap();
        handler.preload_directory("C:\\out").unwrap();
    });
    let config = DetoursConfig {
        keep_in_memory_extensions: vec![".tmp".to_string()],
        ..Default::default()
    };
    let rules = Rules::from_config(&config, "tool.exe");
    let ctx = process(&transport, options(&env, rules, true));

    let calls = transport.call_count();
    for (path, content) in [("C:\\out\\x.tmp", b"scratch".as_slice()), ("C:\\out\\taken.tmp", b"t".as_slice())] {
        let handle = ctx
            .create_file(path, GENERIC_WRITE, CreationDisposition::CreateAlways, false)
            .unwrap();
        ctx.write_file(handle, content).unwrap();
        ctx.close_handle(handle).unwrap();
    }
    // Never on disk, so the session is never asked.
    assert!(!ctx.get_file_attributes("C:\\out\\other.tmp").exists);

    assert_eq!(
        ctx.move_file("C:\\out\\x.tmp", "C:\\out\\taken.tmp", 0),
        Err(Win32Error::ALREADY_EXISTS)
    );
    ctx.move_file("C:\\out\\x.tmp", "C:\\out\\y.tmp", 0).unwrap();
    assert_eq!(transport.call_count(), calls);
    assert!(!ctx.get_file_attributes("C:\\out\\x.tmp").exists);
    assert_eq!(read_all(&ctx, "C:\\out\\y.tmp"), b"scratch");

    let (handle, first) = ctx.find_first_file("C:\\out\\*.tmp").unwrap();
    let second = ctx.find_next_file(handle).unwrap();
    let mut names = vec![first.name, second.name];
    names.sort();
    assert_eq!(names, vec!["taken.tmp", "y.tmp"]);
    ctx.find_close(handle).unwrap();
}

#[test]
fn test_delete_on_close_memory_file_disappears() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_directory("C:\\out").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::new(ToolProfile::Msvc), true));

    let handle = ctx
        .create_file("C:\\out\\t.obj", GENERIC_WRITE, CreationDisposition::CreateNew, true)
        .unwrap();
    ctx.write_file(handle, b"gone").unwrap();
    assert!(ctx.get_file_attributes("C:\\out\\t.obj").exists);
    ctx.close_handle(handle).unwrap();
    assert!(!ctx.get_file_attributes("C:\\out\\t.obj").exists);
}

#[test]
fn test_disk_write_is_reported_on_close() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |_| {});
    let ctx = process(&transport, options(&env, Rules::default(), false));

    let path = env.project_root.join("log.txt");
    let path = path.to_str().unwrap();
    let handle = ctx
        .create_file(path, GENERIC_WRITE, CreationDisposition::CreateAlways, false)
        .unwrap();
    ctx.write_file(handle, b"built ok").unwrap();
    ctx.close_handle(handle).unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"built ok");

    let reader = process(&transport, options(&env, Rules::default(), false));
    let attributes = reader.get_file_attributes(path);
    assert!(attributes.exists);
    assert!(!attributes.use_cache);
    assert_eq!(read_all(&reader, path), b"built ok");
}

#[test]
fn test_rename_on_close_reports_final_name() {
    let env = TestEnvironment::new().unwrap();
    let transport = session(&env, |handler| {
        handler.add_directory("C:\\out").unwrap();
    });
    let ctx = process(&transport, options(&env, Rules::new(ToolProfile::Msvc), true));

    let handle = ctx
        .create_file("C:\\out\\tmp.obj", GENERIC_WRITE, CreationDisposition::CreateNew, false)
        .unwrap();
    ctx.write_file(handle, b"final").unwrap();
    ctx.set_rename_on_close(handle, "C:\\out\\final.obj").unwrap();
    ctx.close_handle(handle).unwrap();

    assert!(!ctx.get_file_attributes("C:\\out\\tmp.obj").exists);
    let other = process(&transport, options(&env, Rules::default(), true));
    assert_eq!(read_all(&other, "C:\\out\\final.obj"), b"final");
}
