//! Request handling against a virtual file system.

use uba_config::testing::TestEnvironment;
use uba_ipc::messages::{CreateFileReply, FileOperationReply};
use uba_ipc::win32::{
    ERROR_ALREADY_EXISTS, ERROR_DIR_NOT_EMPTY, ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND, GENERIC_READ,
    GENERIC_WRITE, MOVEFILE_REPLACE_EXISTING,
};
use uba_ipc::{to_string_key, MappedName, MappingHandle, Reply, Request, TableOffset};
use uba_session::SessionHandler;

fn session(env: &TestEnvironment) -> SessionHandler {
    SessionHandler::new(&env.config().session, false).unwrap()
}

fn open(h: &mut SessionHandler, path: &str, access: u32) -> CreateFileReply {
    let reply = h
        .handle_request(Request::CreateFile {
            file_name: path.into(),
            file_key: to_string_key(path),
            access,
        })
        .unwrap();
    match reply {
        Reply::CreateFile(r) => r,
        other => panic!("unexpected reply {:?}", other),
    }
}

fn file_op(h: &mut SessionHandler, request: Request) -> FileOperationReply {
    match h.handle_request(request).unwrap() {
        Reply::FileOperation(r) => r,
        other => panic!("unexpected reply {:?}", other),
    }
}

fn update_directory(h: &mut SessionHandler, path: &str) -> TableOffset {
    match h
        .handle_request(Request::UpdateDirectory {
            dir_key: to_string_key(path),
            dir_name: path.into(),
        })
        .unwrap()
    {
        Reply::UpdateDirectory(r) => r.table_offset,
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_virtual_file_is_served_from_session_mapping() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    let handle = h
        .add_virtual_files(&[("C:\\proj\\a.h", b"aaaa"), ("C:\\proj\\b.h", b"bb")])
        .unwrap();

    let reply = open(&mut h, "c:/proj/B.H", GENERIC_READ);
    assert_eq!(
        MappedName::parse(&reply.name),
        MappedName::Mapping { handle, offset: 4 }
    );
    assert_eq!(reply.size, 2);
    assert_eq!(reply.close_id, 0);
    assert!(reply.file_table_size > 0);

    let mapping = std::fs::read(env.shm_dir.join(handle.file_name())).unwrap();
    assert_eq!(&mapping[4..6], b"bb");
}

#[test]
fn test_open_missing_and_directory() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    h.add_directory("C:\\proj\\src").unwrap();

    assert_eq!(open(&mut h, "C:\\proj\\none.h", GENERIC_READ).name, "");
    assert_eq!(open(&mut h, "C:\\proj\\src", GENERIC_READ).name, "$d");
}

#[test]
fn test_written_output_becomes_shared_file() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    h.add_directory("C:\\out").unwrap();
    let listed = update_directory(&mut h, "C:\\out");
    assert!(listed.is_valid());

    let reply = open(&mut h, "C:\\out\\a.obj", GENERIC_WRITE);
    assert_eq!(reply.name, "#");
    assert!(reply.close_id > 0);

    let before = h.directory_table_size();
    let close = h
        .handle_request(Request::UpdateCloseHandle {
            file_name: "C:\\out\\a.obj".into(),
            close_id: reply.close_id,
            delete_on_close: false,
            new_name: String::new(),
            mapping_handle: MappingHandle(0x42),
            mapping_written: 300,
            success: true,
        })
        .unwrap();
    match close {
        Reply::UpdateCloseHandle(r) => assert!(r.directory_table_size > before),
        other => panic!("unexpected reply {:?}", other),
    }

    let read = open(&mut h, "C:\\out\\a.obj", GENERIC_READ);
    assert_eq!(
        MappedName::parse(&read.name),
        MappedName::SharedFile {
            handle: MappingHandle(0x42)
        }
    );
    assert_eq!(read.size, 300);
}

#[test]
fn test_close_with_rename_moves_output() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    h.add_directory("C:\\out").unwrap();
    let reply = open(&mut h, "C:\\out\\a.tmp", GENERIC_WRITE);
    h.handle_request(Request::UpdateCloseHandle {
        file_name: "C:\\out\\a.tmp".into(),
        close_id: reply.close_id,
        delete_on_close: false,
        new_name: "C:\\out\\a.obj".into(),
        mapping_handle: MappingHandle(7),
        mapping_written: 10,
        success: true,
    })
    .unwrap();

    assert_eq!(open(&mut h, "C:\\out\\a.tmp", GENERIC_READ).name, "");
    assert_eq!(open(&mut h, "C:\\out\\a.obj", GENERIC_READ).size, 10);
}

#[test]
fn test_missing_directory_then_created() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    h.add_directory("C:\\proj").unwrap();
    assert_eq!(update_directory(&mut h, "C:\\proj\\gen"), TableOffset::INVALID);

    h.add_disk_file("C:\\proj\\gen\\x.h", 12).unwrap();
    let offset = update_directory(&mut h, "C:\\proj\\gen");
    assert!(offset.is_valid());
    assert!(offset.0 < h.directory_table_size());
}

#[test]
fn test_unlisted_parent_is_not_rewritten() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    h.add_disk_file("C:\\proj\\a.h", 1).unwrap();
    assert_eq!(h.directory_table_size(), 0);

    h.preload_directory("C:\\proj").unwrap();
    let size = h.directory_table_size();
    assert!(size > 0);
    h.add_disk_file("C:\\proj\\b.h", 1).unwrap();
    assert!(h.directory_table_size() > size);
}

#[test]
fn test_create_and_remove_directory_errors() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    h.add_directory("C:\\proj").unwrap();

    let missing_parent = file_op(
        &mut h,
        Request::CreateDirectory {
            dir_name: "C:\\nope\\x".into(),
            dir_key: to_string_key("C:\\nope\\x"),
        },
    );
    assert!(!missing_parent.success);
    assert_eq!(missing_parent.error_code, ERROR_PATH_NOT_FOUND);

    let created = file_op(
        &mut h,
        Request::CreateDirectory {
            dir_name: "C:\\proj\\out".into(),
            dir_key: to_string_key("C:\\proj\\out"),
        },
    );
    assert!(created.success);
    // The new directory is listed right away.
    assert!(update_directory(&mut h, "C:\\proj\\out").is_valid());

    let again = file_op(
        &mut h,
        Request::CreateDirectory {
            dir_name: "C:\\proj\\out".into(),
            dir_key: to_string_key("C:\\proj\\out"),
        },
    );
    assert_eq!(again.error_code, ERROR_ALREADY_EXISTS);

    h.add_disk_file("C:\\proj\\out\\a.obj", 4).unwrap();
    let not_empty = file_op(
        &mut h,
        Request::RemoveDirectory {
            dir_name: "C:\\proj\\out".into(),
            dir_key: to_string_key("C:\\proj\\out"),
        },
    );
    assert_eq!(not_empty.error_code, ERROR_DIR_NOT_EMPTY);
}

#[test]
fn test_delete_and_move() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    h.add_virtual_file("C:\\proj\\a.txt", b"a").unwrap();
    h.add_virtual_file("C:\\proj\\b.txt", b"bb").unwrap();

    let not_found = file_op(
        &mut h,
        Request::DeleteFile {
            file_name: "C:\\proj\\zzz".into(),
            file_key: to_string_key("C:\\proj\\zzz"),
            close_id: 0,
        },
    );
    assert_eq!(not_found.error_code, ERROR_FILE_NOT_FOUND);

    let blocked = file_op(
        &mut h,
        Request::MoveFile {
            from: "C:\\proj\\a.txt".into(),
            from_key: to_string_key("C:\\proj\\a.txt"),
            to: "C:\\proj\\b.txt".into(),
            to_key: to_string_key("C:\\proj\\b.txt"),
            flags: 0,
        },
    );
    assert_eq!(blocked.error_code, ERROR_ALREADY_EXISTS);

    let moved = file_op(
        &mut h,
        Request::MoveFile {
            from: "C:\\proj\\a.txt".into(),
            from_key: to_string_key("C:\\proj\\a.txt"),
            to: "C:\\proj\\b.txt".into(),
            to_key: to_string_key("C:\\proj\\b.txt"),
            flags: MOVEFILE_REPLACE_EXISTING,
        },
    );
    assert!(moved.success);
    assert_eq!(open(&mut h, "C:\\proj\\b.txt", GENERIC_READ).size, 1);

    let deleted = file_op(
        &mut h,
        Request::DeleteFile {
            file_name: "C:\\proj\\b.txt".into(),
            file_key: to_string_key("C:\\proj\\b.txt"),
            close_id: 0,
        },
    );
    assert!(deleted.success);
    assert_eq!(open(&mut h, "C:\\proj\\b.txt", GENERIC_READ).name, "");
}

#[test]
fn test_temp_files_are_reported_by_update_tables() {
    let env = TestEnvironment::new().unwrap();
    let mut h = session(&env);
    let key = to_string_key("C:\\tmp\\x.tmp");
    h.handle_request(Request::CreateTempFile {
        file_key: key,
        file_name: "C:\\tmp\\x.tmp".into(),
        mapping_handle: MappingHandle(0x99),
        size: 64,
    })
    .unwrap();

    match h
        .handle_request(Request::OpenTempFile {
            file_key: key,
            file_name: "C:\\tmp\\x.tmp".into(),
        })
        .unwrap()
    {
        Reply::OpenTempFile(r) => {
            assert_eq!(r.mapping_handle, MappingHandle(0x99));
            assert_eq!(r.size, 64);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    match h.handle_request(Request::UpdateTables).unwrap() {
        Reply::UpdateTables(r) => {
            assert_eq!(r.temp_files.len(), 1);
            assert_eq!(r.temp_files[0].file_key, key);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    match h
        .handle_request(Request::OpenTempFile {
            file_key: to_string_key("C:\\tmp\\other.tmp"),
            file_name: "C:\\tmp\\other.tmp".into(),
        })
        .unwrap()
    {
        Reply::OpenTempFile(r) => assert!(r.mapping_handle.is_none()),
        other => panic!("unexpected reply {:?}", other),
    }
}
