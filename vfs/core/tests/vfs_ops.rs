//! File, directory and path semantics through the full dispatch surface,
//! with an in-memory handler mounted at the root.

use std::sync::Arc;

use ptfs_core::{
    Errno, FcntlCmd, FileSystemHandler, OpenFlags, ProcessEnvironment, SystemEnvironment, Vfs,
    VfsOptions, FIRST_APP_UID,
};
use ptfs_mem::MemHandler;
use ptfs_overlay::RedirectHandler;

fn new_vfs() -> (Arc<Vfs>, Arc<SystemEnvironment>) {
    let env = Arc::new(SystemEnvironment::new());
    let vfs = Vfs::new(MemHandler::new(), env.clone(), VfsOptions::default());
    (vfs, env)
}

fn create_file(vfs: &Vfs, path: &str, data: &[u8]) {
    let fd = vfs
        .open(path, OpenFlags::WRONLY | OpenFlags::CREAT, 0o600)
        .expect("create");
    if !data.is_empty() {
        vfs.write(fd, data).expect("write");
    }
    vfs.close(fd).expect("close");
}

#[test]
fn open_returns_lowest_unused_descriptor() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/a", b"");
    create_file(&vfs, "/b", b"");
    create_file(&vfs, "/c", b"");

    let fd_a = vfs.open("/a", OpenFlags::RDONLY, 0).expect("open a");
    let fd_b = vfs.open("/b", OpenFlags::RDONLY, 0).expect("open b");
    assert_eq!(fd_a, 3);
    assert_eq!(fd_b, 4);
    vfs.close(fd_a).expect("close");
    let fd_c = vfs.open("/c", OpenFlags::RDONLY, 0).expect("open c");
    assert_eq!(fd_c, 3);
}

#[test]
fn descriptor_exhaustion_is_emfile() {
    let env = Arc::new(SystemEnvironment::new());
    let vfs = Vfs::new(
        MemHandler::new(),
        env,
        VfsOptions {
            max_fd: 4,
            ..VfsOptions::default()
        },
    );
    create_file(&vfs, "/a", b"");
    let _fd1 = vfs.open("/a", OpenFlags::RDONLY, 0).expect("open");
    let _fd2 = vfs.open("/a", OpenFlags::RDONLY, 0).expect("open");
    let err = vfs.open("/a", OpenFlags::RDONLY, 0).expect_err("full");
    assert_eq!(err.errno(), Errno::MFILE);
}

#[test]
fn close_then_reuse_and_close_of_unknown_fd() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/a", b"x");
    let fd = vfs.open("/a", OpenFlags::RDONLY, 0).expect("open");
    vfs.close(fd).expect("close");
    assert_eq!(vfs.close(fd).expect_err("closed").errno(), Errno::BADF);
    assert_eq!(vfs.read(fd, &mut [0u8; 1]).expect_err("closed").errno(), Errno::BADF);
}

#[test]
fn read_write_lseek_pread_pwrite() {
    let (vfs, _env) = new_vfs();
    let fd = vfs
        .open("/data", OpenFlags::RDWR | OpenFlags::CREAT, 0o600)
        .expect("create");
    assert_eq!(vfs.write(fd, b"hello world").expect("write"), 11);

    let mut buf = [0u8; 5];
    assert_eq!(vfs.pread(fd, &mut buf, 6).expect("pread"), 5);
    assert_eq!(&buf, b"world");

    vfs.lseek(fd, 0, ptfs_core::Whence::Set).expect("seek");
    assert_eq!(vfs.read(fd, &mut buf).expect("read"), 5);
    assert_eq!(&buf, b"hello");

    assert_eq!(vfs.pwrite(fd, b"HELLO", 0).expect("pwrite"), 5);
    assert_eq!(vfs.pread(fd, &mut buf, 0).expect("pread"), 5);
    assert_eq!(&buf, b"HELLO");
    vfs.close(fd).expect("close");
}

#[test]
fn dup_binds_lowest_free_descriptor_to_same_stream() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/a", b"shared");
    let fd = vfs.open("/a", OpenFlags::RDONLY, 0).expect("open");
    let dup = vfs.dup(fd).expect("dup");
    assert_eq!(dup, fd + 1);

    // Shared offset: reading via one fd advances the other.
    let mut buf = [0u8; 3];
    vfs.read(fd, &mut buf).expect("read");
    assert_eq!(&buf, b"sha");
    vfs.read(dup, &mut buf).expect("read");
    assert_eq!(&buf, b"red");

    vfs.close(fd).expect("close");
    // The stream survives through the remaining descriptor.
    assert!(vfs.fstat(dup).is_ok());
    vfs.close(dup).expect("close");
}

#[test]
fn dup2_closes_target_and_self_dup_is_noop() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/a", b"");
    create_file(&vfs, "/b", b"");
    let fd_a = vfs.open("/a", OpenFlags::RDONLY, 0).expect("open");
    let fd_b = vfs.open("/b", OpenFlags::RDONLY, 0).expect("open");

    assert_eq!(vfs.dup2(fd_a, fd_a).expect("self dup"), fd_a);

    assert_eq!(vfs.dup2(fd_a, fd_b).expect("dup2"), fd_b);
    let st = vfs.fstat(fd_b).expect("fstat");
    let st_a = vfs.fstat(fd_a).expect("fstat");
    assert_eq!(st.ino, st_a.ino);

    assert_eq!(
        vfs.dup(999).expect_err("unknown").errno(),
        Errno::BADF
    );
}

#[test]
fn fcntl_dupfd_getfl_setfl() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/a", b"");
    let fd = vfs.open("/a", OpenFlags::RDONLY, 0).expect("open");
    let dup = vfs.fcntl(fd, FcntlCmd::DupFd(10)).expect("dupfd");
    assert_eq!(dup, 10);

    let flags = vfs.fcntl(fd, FcntlCmd::GetFl).expect("getfl");
    assert_eq!(flags as i32 & libc::O_ACCMODE, libc::O_RDONLY);

    vfs.fcntl(fd, FcntlCmd::SetFl(OpenFlags::NONBLOCK)).expect("setfl");
    let flags = vfs.fcntl(fd, FcntlCmd::GetFl).expect("getfl");
    assert_ne!(flags as i32 & libc::O_NONBLOCK, 0);
}

#[test]
fn stat_assigns_stable_inodes_lazily() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/a", b"1");
    create_file(&vfs, "/b", b"2");
    let st_a = vfs.stat("/a").expect("stat");
    let st_b = vfs.stat("/b").expect("stat");
    assert!(st_a.ino >= 128);
    assert_ne!(st_a.ino, st_b.ino);
    assert_eq!(vfs.stat("/a").expect("stat").ino, st_a.ino);
}

#[test]
fn rename_carries_the_inode_and_removes_the_source() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/old", b"data");
    let ino = vfs.stat("/old").expect("stat").ino;

    vfs.rename("/old", "/new").expect("rename");
    assert_eq!(vfs.stat("/new").expect("stat").ino, ino);
    assert_eq!(vfs.stat("/old").expect_err("gone").errno(), Errno::NOENT);
}

#[test]
fn rename_onto_itself_requires_existence_only() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/same", b"");
    vfs.rename("/same", "/same").expect("same-path rename");
    assert_eq!(
        vfs.rename("/ghost", "/ghost").expect_err("missing").errno(),
        Errno::NOENT
    );
}

#[test]
fn unlink_releases_the_inode() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/f", b"");
    let ino = vfs.stat("/f").expect("stat").ino;
    vfs.unlink("/f").expect("unlink");
    create_file(&vfs, "/f", b"");
    assert_ne!(vfs.stat("/f").expect("stat").ino, ino);
}

#[test]
fn mkdir_getdents_rmdir() {
    let (vfs, _env) = new_vfs();
    vfs.mkdir("/d", 0o755).expect("mkdir");
    create_file(&vfs, "/d/one", b"");
    create_file(&vfs, "/d/two", b"");

    let fd = vfs
        .open("/d", OpenFlags::RDONLY | OpenFlags::DIRECTORY, 0)
        .expect("opendir");
    let entries = vfs.getdents(fd, 4096).expect("getdents");
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "one", "two"]);
    // Entry inodes match stat.
    let one = entries.iter().find(|e| e.name == "one").expect("entry");
    assert_eq!(one.ino, vfs.stat("/d/one").expect("stat").ino);
    // Drained: the next batch is empty until a rewind.
    assert!(vfs.getdents(fd, 4096).expect("getdents").is_empty());
    vfs.lseek(fd, 0, ptfs_core::Whence::Set).expect("rewind");
    assert_eq!(vfs.getdents(fd, 4096).expect("getdents").len(), 4);
    vfs.close(fd).expect("close");

    assert_eq!(vfs.rmdir("/d").expect_err("not empty").errno(), Errno::NOTEMPTY);
    vfs.unlink("/d/one").expect("unlink");
    vfs.unlink("/d/two").expect("unlink");
    vfs.rmdir("/d").expect("rmdir");
}

#[test]
fn getdents_respects_the_byte_budget() {
    let (vfs, _env) = new_vfs();
    vfs.mkdir("/d", 0o755).expect("mkdir");
    for i in 0..8 {
        create_file(&vfs, &format!("/d/file{i}"), b"");
    }
    let fd = vfs
        .open("/d", OpenFlags::RDONLY | OpenFlags::DIRECTORY, 0)
        .expect("opendir");
    let mut total = 0;
    loop {
        let batch = vfs.getdents(fd, 64).expect("getdents");
        if batch.is_empty() {
            break;
        }
        assert!(batch.len() <= 2, "64 bytes fit at most two records");
        total += batch.len();
    }
    assert_eq!(total, 10);
    vfs.close(fd).expect("close");
}

#[test]
fn normalization_is_idempotent_and_collapses_dots() {
    let (vfs, _env) = new_vfs();
    vfs.mkdir("/a", 0o755).expect("mkdir");
    vfs.mkdir("/a/b", 0o755).expect("mkdir");
    vfs.mkdir("/a/c", 0o755).expect("mkdir");

    assert_eq!(vfs.normalize("/a/./b//../c").expect("normalize"), "/a/c");
    assert_eq!(vfs.normalize("/..").expect("normalize"), "/");
    assert_eq!(vfs.normalize("/a/b/").expect("normalize"), "/a/b");

    for p in ["/", "/a", "/a/b", "/a/c"] {
        assert_eq!(vfs.normalize(p).expect("normalize"), p);
    }
}

#[test]
fn relative_paths_resolve_against_the_cwd() {
    let (vfs, _env) = new_vfs();
    vfs.mkdir("/work", 0o755).expect("mkdir");
    create_file(&vfs, "/work/file", b"cwd");
    vfs.chdir("/work").expect("chdir");

    let mut buf = [0u8; 16];
    assert_eq!(vfs.getcwd(&mut buf).expect("getcwd"), "/work".len() + 1);
    assert_eq!(&buf[..5], b"/work");

    let fd = vfs.open("file", OpenFlags::RDONLY, 0).expect("open relative");
    let mut data = [0u8; 3];
    vfs.read(fd, &mut data).expect("read");
    assert_eq!(&data, b"cwd");
    vfs.close(fd).expect("close");

    assert_eq!(vfs.normalize(".").expect("normalize"), "/work");
    assert_eq!(vfs.normalize("..").expect("normalize"), "/");
}

#[test]
fn chdir_rejects_files_and_missing_paths() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/plain", b"");
    assert_eq!(vfs.chdir("/plain").expect_err("file").errno(), Errno::NOTDIR);
    assert_eq!(vfs.chdir("/missing").expect_err("absent").errno(), Errno::NOENT);
    assert_eq!(vfs.chdir("").expect_err("empty").errno(), Errno::NOENT);
    // Trailing slashes are fine for directories.
    vfs.mkdir("/dir", 0o755).expect("mkdir");
    vfs.chdir("/dir/").expect("chdir with slash");
    assert_eq!(vfs.getcwd_alloc(0).expect("getcwd"), "/dir");
}

#[test]
fn getcwd_buffer_matrix() {
    let (vfs, _env) = new_vfs();
    vfs.mkdir("/workdir", 0o755).expect("mkdir");
    vfs.chdir("/workdir").expect("chdir");

    // Exact-size allocation is strlen + 1.
    let cwd = vfs.getcwd_alloc(0).expect("alloc");
    assert_eq!(cwd, "/workdir");
    assert_eq!(cwd.len() + 1, "/workdir".len() + 1);

    assert_eq!(
        vfs.getcwd_alloc("/workdir".len()).expect_err("too small").errno(),
        Errno::RANGE
    );
    vfs.getcwd_alloc("/workdir".len() + 1).expect("big enough");

    let mut small = [0u8; 4];
    assert_eq!(vfs.getcwd(&mut small).expect_err("small").errno(), Errno::RANGE);
    let mut empty = [0u8; 0];
    assert_eq!(vfs.getcwd(&mut empty).expect_err("empty").errno(), Errno::INVAL);
}

#[test]
fn realpath_requires_existence_and_resolves() {
    let (vfs, _env) = new_vfs();
    vfs.mkdir("/real", 0o755).expect("mkdir");
    create_file(&vfs, "/real/file", b"");
    assert_eq!(
        vfs.realpath("/real/../real/./file").expect("realpath"),
        "/real/file"
    );
    assert_eq!(
        vfs.realpath("/real/ghost").expect_err("missing").errno(),
        Errno::NOENT
    );
}

#[test]
fn umask_round_trips_through_the_environment() {
    let (vfs, _env) = new_vfs();
    let old = vfs.umask(0o077);
    assert_eq!(old, 0o022);
    assert_eq!(vfs.umask(0o022), 0o077);
}

#[test]
fn truncate_ftruncate_and_negative_length() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/t", b"0123456789");
    vfs.truncate("/t", 4).expect("truncate");
    assert_eq!(vfs.stat("/t").expect("stat").size, 4);
    assert_eq!(vfs.truncate("/t", -1).expect_err("negative").errno(), Errno::INVAL);

    let fd = vfs.open("/t", OpenFlags::RDWR, 0).expect("open");
    vfs.ftruncate(fd, 0).expect("ftruncate");
    assert_eq!(vfs.fstat(fd).expect("fstat").size, 0);
    assert_eq!(vfs.ftruncate(fd, -5).expect_err("negative").errno(), Errno::INVAL);
    vfs.close(fd).expect("close");
}

#[test]
fn utimes_sets_file_times() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/stamp", b"");
    vfs.utime("/stamp", 111, 222).expect("utime");
    let st = vfs.stat("/stamp").expect("stat");
    assert_eq!(st.atime.sec, 111);
    assert_eq!(st.mtime.sec, 222);
}

#[test]
fn statfs_statvfs_and_pathconf_hook() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/f", b"");
    let statfs = vfs.statfs("/f").expect("statfs");
    assert_eq!(statfs.bsize, 4096);
    let statvfs = vfs.statvfs("/f").expect("statvfs");
    assert_eq!(statvfs.bsize, 4096);
    assert_eq!(statvfs.namemax, 255);

    // No hook: ENOSYS. With a hook: delegated.
    assert_eq!(
        vfs.pathconf("/f", libc::_PC_NAME_MAX).expect_err("no hook").errno(),
        Errno::NOSYS
    );
    vfs.set_fs_conf_hook(Box::new(|statfs, name| {
        if name == libc::_PC_NAME_MAX {
            Ok(statfs.namelen)
        } else {
            Err(ptfs_core::VfsError::new(Errno::INVAL, "test.fs_conf"))
        }
    }));
    assert_eq!(vfs.pathconf("/f", libc::_PC_NAME_MAX).expect("hook"), 255);
    let fd = vfs.open("/f", OpenFlags::RDONLY, 0).expect("open");
    assert_eq!(vfs.fpathconf(fd, libc::_PC_NAME_MAX).expect("hook"), 255);
    vfs.close(fd).expect("close");
}

#[test]
fn fstat_fills_ownership_and_default_modes() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/sys_file", b"x");
    let st = vfs.stat("/sys_file").expect("stat");
    // Root-owned mount, mode left to the VFS default for system files.
    assert_eq!(st.uid, 0);
    assert_eq!(st.mode & 0o777, 0o644);
    assert!(st.is_regular());

    vfs.mkdir("/sys_dir", 0o755).expect("mkdir");
    let st = vfs.stat("/sys_dir").expect("stat");
    assert_eq!(st.mode & 0o777, 0o755);
}

#[test]
fn app_uid_cannot_modify_system_paths() {
    let (vfs, env) = new_vfs();
    create_file(&vfs, "/ro_file", b"data");
    vfs.mkdir("/ro_dir", 0o755).expect("mkdir");
    env.set_uid(FIRST_APP_UID + 1);

    // Plain write-intent open on an existing file.
    assert_eq!(
        vfs.open("/ro_file", OpenFlags::WRONLY, 0).expect_err("ro").errno(),
        Errno::ACCES
    );
    // O_CREAT against an existing directory prefers EISDIR.
    assert_eq!(
        vfs.open("/ro_dir", OpenFlags::WRONLY | OpenFlags::CREAT, 0o600)
            .expect_err("dir")
            .errno(),
        Errno::ISDIR
    );
    // O_CREAT|O_EXCL against an existing file prefers EEXIST.
    assert_eq!(
        vfs.open(
            "/ro_file",
            OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::EXCL,
            0o600
        )
        .expect_err("exists")
        .errno(),
        Errno::EXIST
    );
    // Creating a fresh name in a read-only directory is plain EACCES.
    assert_eq!(
        vfs.open("/fresh", OpenFlags::WRONLY | OpenFlags::CREAT, 0o600)
            .expect_err("acces")
            .errno(),
        Errno::ACCES
    );
    // Reads stay permitted.
    let fd = vfs.open("/ro_file", OpenFlags::RDONLY, 0).expect("read-only open");
    vfs.close(fd).expect("close");

    assert_eq!(vfs.unlink("/ro_file").expect_err("ro").errno(), Errno::ACCES);
    assert_eq!(vfs.mkdir("/ro_dir/sub", 0o700).expect_err("ro").errno(), Errno::ACCES);
    assert_eq!(
        vfs.unlink("/ro_missing").expect_err("missing wins").errno(),
        Errno::NOENT
    );
}

#[test]
fn rename_error_preference_is_enotdir_over_enoent_over_eacces() {
    let (vfs, env) = new_vfs();
    create_file(&vfs, "/blocker", b"");
    vfs.mkdir("/dest_dir", 0o755).expect("mkdir");
    env.set_uid(FIRST_APP_UID + 1);

    // Source parent is a file (ENOTDIR); destination is read-only (EACCES).
    assert_eq!(
        vfs.rename("/blocker/x", "/dest_dir/y").expect_err("merge").errno(),
        Errno::NOTDIR
    );
    // Source missing (ENOENT); destination read-only (EACCES).
    assert_eq!(
        vfs.rename("/missing", "/dest_dir/y").expect_err("merge").errno(),
        Errno::NOENT
    );
    // Both sides only fail the permission check.
    create_file_as_root(&vfs, &env, "/src");
    assert_eq!(
        vfs.rename("/src", "/dest_dir/y").expect_err("acces").errno(),
        Errno::ACCES
    );
}

fn create_file_as_root(vfs: &Vfs, env: &SystemEnvironment, path: &str) {
    let uid = env.current_uid();
    env.set_uid(0);
    create_file(vfs, path, b"");
    env.set_uid(uid);
}

#[test]
fn access_checks_write_and_exec_bits() {
    let (vfs, env) = new_vfs();
    create_file(&vfs, "/bin_sh", b"#!");
    assert!(vfs.access("/bin_sh", libc::R_OK).is_ok());
    assert!(vfs.access("/bin_sh", libc::W_OK).is_ok());

    env.set_uid(FIRST_APP_UID);
    // System file without S_IWOTH: not writable for apps.
    assert_eq!(
        vfs.access("/bin_sh", libc::W_OK).expect_err("ro").errno(),
        Errno::ACCES
    );
    // 0644 has no exec bit.
    assert_eq!(
        vfs.access("/bin_sh", libc::X_OK).expect_err("noexec").errno(),
        Errno::ACCES
    );
    assert!(vfs.access("/bin_sh", libc::R_OK).is_ok());
    assert_eq!(
        vfs.access("/nope", libc::F_OK).expect_err("missing").errno(),
        Errno::NOENT
    );
}

#[test]
fn chown_gives_app_uids_ownership_of_a_subtree() {
    let (vfs, env) = new_vfs();
    vfs.mkdir("/data", 0o755).expect("mkdir");
    vfs.mkdir("/data/app", 0o700).expect("mkdir");
    vfs.chown("/data/app", FIRST_APP_UID).expect("chown");

    env.set_uid(FIRST_APP_UID);
    // The app can now create under its own directory.
    create_file(&vfs, "/data/app/owned", b"mine");
    let st = vfs.stat("/data/app/owned").expect("stat");
    assert_eq!(st.uid, FIRST_APP_UID);
    assert_eq!(st.mode & 0o777, 0o600);
    // Other system paths remain read-only, and chown itself is denied.
    assert_eq!(
        vfs.chown("/data", FIRST_APP_UID).expect_err("app chown").errno(),
        Errno::PERM
    );
}

#[test]
fn overlay_symlinks_resolve_through_the_vfs() {
    let env = Arc::new(SystemEnvironment::new());
    let mem = MemHandler::new();
    mem.mkdir("/system", 0o755).expect("mkdir");
    mem.mkdir("/system/lib", 0o755).expect("mkdir");
    let overlay = RedirectHandler::new(mem, &[("/system/lib", "/lib")]);
    let vfs = Vfs::new(overlay, env, VfsOptions::default());

    create_file(&vfs, "/system/lib/libc.so", b"ELF");

    // Dispatch goes to the real path.
    let fd = vfs.open("/lib/libc.so", OpenFlags::RDONLY, 0).expect("open via link");
    let mut buf = [0u8; 3];
    vfs.read(fd, &mut buf).expect("read");
    assert_eq!(&buf, b"ELF");
    vfs.close(fd).expect("close");

    assert_eq!(vfs.readlink("/lib").expect("readlink"), "/system/lib");
    assert_eq!(vfs.normalize("/lib/libc.so").expect("normalize"), "/system/lib/libc.so");

    let st = vfs.lstat("/lib").expect("lstat");
    assert!(st.is_symlink());
    assert_eq!(st.mode, libc::S_IFLNK | 0o777);
    assert_eq!(st.size, "/system/lib".len() as i64);

    // stat() follows the link; readlink on a non-link is EINVAL.
    assert!(vfs.stat("/lib").expect("stat").is_dir());
    assert_eq!(
        vfs.readlink("/system").expect_err("plain dir").errno(),
        Errno::INVAL
    );

    // Listing the root shows the link entry.
    let fd = vfs
        .open("/", OpenFlags::RDONLY | OpenFlags::DIRECTORY, 0)
        .expect("opendir");
    let entries = vfs.getdents(fd, 4096).expect("getdents");
    assert!(entries
        .iter()
        .any(|e| e.name == "lib" && e.entry_type == ptfs_core::DirEntryType::Symlink));
    vfs.close(fd).expect("close");
}

#[test]
fn symlink_loops_fail_with_eloop() {
    let (vfs, _env) = new_vfs();
    vfs.symlink("/loop_b", "/loop_a").expect("symlink");
    vfs.symlink("/loop_a", "/loop_b").expect("symlink");
    assert_eq!(vfs.stat("/loop_a").expect_err("loop").errno(), Errno::LOOP);
}

#[test]
fn unlink_acts_on_the_link_not_the_target() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/target", b"kept");
    vfs.symlink("/target", "/link").expect("symlink");

    assert_eq!(vfs.stat("/link").expect("follows").size, 4);
    vfs.unlink("/link").expect("unlink link");
    assert!(vfs.stat("/target").is_ok());
    assert_eq!(vfs.lstat("/link").expect_err("gone").errno(), Errno::NOENT);
}

#[test]
fn mounts_route_by_longest_prefix_and_unmount_restores() {
    let (vfs, _env) = new_vfs();
    let second: Arc<dyn FileSystemHandler> = MemHandler::new();
    second.on_mounted("/");
    second.mkdir("/mnt", 0o755).expect("mkdir");
    create_file_direct(&second, "/mnt/inner", b"second");

    vfs.mkdir("/mnt", 0o755).expect("mkdir on root handler");
    vfs.mount("/mnt", second);

    let fd = vfs.open("/mnt/inner", OpenFlags::RDONLY, 0).expect("open");
    let mut buf = [0u8; 6];
    vfs.read(fd, &mut buf).expect("read");
    assert_eq!(&buf, b"second");
    vfs.close(fd).expect("close");

    vfs.unmount("/mnt");
    assert_eq!(
        vfs.open("/mnt/inner", OpenFlags::RDONLY, 0).expect_err("root again").errno(),
        Errno::NOENT
    );
}

fn create_file_direct(handler: &Arc<dyn FileSystemHandler>, path: &str, data: &[u8]) {
    let stream = handler
        .open(3, path, OpenFlags::WRONLY | OpenFlags::CREAT, 0o600)
        .expect("create");
    stream.write(data).expect("write");
}

#[test]
fn known_descriptor_tracking() {
    let (vfs, _env) = new_vfs();
    create_file(&vfs, "/f", b"");
    let fd = vfs.open("/f", OpenFlags::RDONLY, 0).expect("open");
    assert!(vfs.is_known_descriptor(fd));
    assert!(!vfs.is_known_descriptor(fd + 1));
    vfs.close(fd).expect("close");
    assert!(!vfs.is_known_descriptor(fd));
}
