//! The preopen prefetcher: scheduling, the worker, cache hits and
//! invalidation.

use std::sync::Arc;

use ptfs_core::{Errno, OpenFlags, SystemEnvironment, Vfs, VfsOptions};
use ptfs_mem::MemHandler;

fn new_vfs_with_preopen() -> Arc<Vfs> {
    let env = Arc::new(SystemEnvironment::new());
    Vfs::new(
        MemHandler::new(),
        env,
        VfsOptions {
            enable_preopen: true,
            ..VfsOptions::default()
        },
    )
}

fn create_file(vfs: &Vfs, path: &str, data: &[u8]) {
    let fd = vfs
        .open(path, OpenFlags::WRONLY | OpenFlags::CREAT, 0o600)
        .expect("create");
    vfs.write(fd, data).expect("write");
    vfs.close(fd).expect("close");
}

#[test]
fn preopen_hit_is_single_shot() {
    let vfs = new_vfs_with_preopen();
    vfs.mkdir("/etc", 0o755).expect("mkdir");
    create_file(&vfs, "/etc/passwd", b"root:x:0:0");

    vfs.schedule_preopen("/etc/passwd").expect("schedule");
    vfs.set_host_ready();

    // The open blocks until the worker realizes the entry, then takes the
    // cached descriptor.
    let first = vfs.open("/etc/passwd", OpenFlags::RDONLY, 0).expect("preopened");
    let mut buf = [0u8; 10];
    assert_eq!(vfs.read(first, &mut buf).expect("read"), 10);
    assert_eq!(&buf, b"root:x:0:0");

    // Single shot: a second open performs a fresh open and gets a new fd.
    let second = vfs.open("/etc/passwd", OpenFlags::RDONLY, 0).expect("fresh");
    assert_ne!(first, second);
    vfs.close(first).expect("close");
    vfs.close(second).expect("close");
}

#[test]
fn failed_preopen_surfaces_the_worker_errno() {
    let vfs = new_vfs_with_preopen();
    vfs.schedule_preopen("/does/not/exist").expect("schedule");
    vfs.set_host_ready();

    let err = vfs
        .open("/does/not/exist", OpenFlags::RDONLY, 0)
        .expect_err("cached failure");
    assert_eq!(err.errno(), Errno::NOENT);
}

#[test]
fn invalidation_before_the_worker_prevents_stale_results() {
    let vfs = new_vfs_with_preopen();
    create_file(&vfs, "/victim", b"soon gone");
    vfs.schedule_preopen("/victim").expect("schedule");

    // The unlink lands before the worker ever runs; the pending entry dies
    // with it.
    vfs.unlink("/victim").expect("unlink");
    vfs.set_host_ready();

    let err = vfs.open("/victim", OpenFlags::RDONLY, 0).expect_err("gone");
    assert_eq!(err.errno(), Errno::NOENT);
}

#[test]
fn creating_open_invalidates_a_cached_failure() {
    let vfs = new_vfs_with_preopen();
    // The file does not exist yet, so the worker caches an error marker.
    vfs.schedule_preopen("/late").expect("schedule");
    vfs.schedule_preopen("/sentinel").expect("schedule");
    vfs.set_host_ready();

    // Consuming the sentinel proves the worker finished the whole schedule.
    assert_eq!(
        vfs.open("/sentinel", OpenFlags::RDONLY, 0)
            .expect_err("sentinel missing")
            .errno(),
        Errno::NOENT
    );

    // The creating open must flush the cached failure for the path...
    create_file(&vfs, "/late", b"now present");
    // ...so this read does not see the stale ENOENT marker.
    let fd = vfs.open("/late", OpenFlags::RDONLY, 0).expect("created");
    let mut buf = [0u8; 11];
    assert_eq!(vfs.read(fd, &mut buf).expect("read"), 11);
    vfs.close(fd).expect("close");
}

#[test]
fn rename_invalidates_both_endpoints() {
    let vfs = new_vfs_with_preopen();
    create_file(&vfs, "/from", b"1");
    create_file(&vfs, "/to", b"2");
    vfs.schedule_preopen("/from").expect("schedule");
    vfs.schedule_preopen("/to").expect("schedule");
    vfs.set_host_ready();

    // Consume one entry so the worker is definitely done with both.
    let fd = vfs.open("/from", OpenFlags::RDONLY, 0).expect("warm");
    vfs.close(fd).expect("close");

    vfs.rename("/from", "/to").expect("rename");
    // No stale descriptor: the open reflects the post-rename tree.
    let fd = vfs.open("/to", OpenFlags::RDONLY, 0).expect("open");
    let mut buf = [0u8; 2];
    assert_eq!(vfs.read(fd, &mut buf).expect("read"), 1);
    assert_eq!(&buf[..1], b"1");
    vfs.close(fd).expect("close");
    assert_eq!(
        vfs.open("/from", OpenFlags::RDONLY, 0).expect_err("moved").errno(),
        Errno::NOENT
    );
}

#[test]
#[should_panic(expected = "schedule_preopen called after the preopen worker started")]
fn scheduling_after_the_worker_started_is_fatal() {
    let vfs = new_vfs_with_preopen();
    vfs.set_host_ready();
    let _ = vfs.schedule_preopen("/too/late");
}
