//! Pipes, local sockets, and the poll/select/epoll readiness engine.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ptfs_core::{
    EpollEvent, EpollEvents, EpollOp, Errno, FdSet, IoctlRequest, MsgFlags, OpenFlags, PollEvents,
    PollFd, ShutdownHow, SocketAddress, SystemEnvironment, Vfs, VfsOptions,
};
use ptfs_mem::MemHandler;

fn new_vfs() -> Arc<Vfs> {
    let env = Arc::new(SystemEnvironment::new());
    Vfs::new(MemHandler::new(), env, VfsOptions::default())
}

#[test]
fn pipe_transfers_bytes_in_order() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    assert_eq!(vfs.write(write_fd, b"through the pipe").expect("write"), 16);
    let mut buf = [0u8; 7];
    assert_eq!(vfs.read(read_fd, &mut buf).expect("read"), 7);
    assert_eq!(&buf, b"through");
    // FIONREAD reports what is left.
    assert_eq!(vfs.ioctl(read_fd, IoctlRequest::Fionread).expect("ioctl"), 9);
    vfs.close(read_fd).expect("close");
    vfs.close(write_fd).expect("close");
}

#[test]
fn pipe_direction_is_enforced() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    assert_eq!(
        vfs.write(read_fd, b"x").expect_err("read end").errno(),
        Errno::BADF
    );
    assert_eq!(
        vfs.read(write_fd, &mut [0u8; 1]).expect_err("write end").errno(),
        Errno::BADF
    );
}

#[test]
fn nonblocking_read_on_empty_pipe_is_eagain() {
    let vfs = new_vfs();
    let [read_fd, _write_fd] = vfs.pipe2(OpenFlags::NONBLOCK).expect("pipe2");
    let err = vfs.read(read_fd, &mut [0u8; 4]).expect_err("empty");
    assert_eq!(err.errno(), Errno::AGAIN);
}

#[test]
fn blocking_read_waits_for_a_writer() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");

    let writer_vfs = vfs.clone();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        writer_vfs.write(write_fd, b"late").expect("write");
    });

    let mut buf = [0u8; 8];
    let n = vfs.read(read_fd, &mut buf).expect("blocking read");
    assert_eq!(&buf[..n], b"late");
    writer.join().expect("writer");
}

#[test]
fn closing_the_writer_wakes_readers_with_eof() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");

    let closer_vfs = vfs.clone();
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        closer_vfs.close(write_fd).expect("close");
    });

    let n = vfs.read(read_fd, &mut [0u8; 4]).expect("eof");
    assert_eq!(n, 0);
    closer.join().expect("closer");
}

#[test]
fn write_after_reader_close_is_epipe() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    vfs.close(read_fd).expect("close");
    assert_eq!(
        vfs.write(write_fd, b"x").expect_err("broken").errno(),
        Errno::PIPE
    );
}

#[test]
fn socketpair_carries_messages_both_ways() {
    let vfs = new_vfs();
    let [a, b] = vfs
        .socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0)
        .expect("socketpair");
    vfs.send(a, b"ping", MsgFlags::empty()).expect("send");
    vfs.send(b, b"pong", MsgFlags::empty()).expect("send");
    let mut buf = [0u8; 8];
    assert_eq!(vfs.recv(b, &mut buf, MsgFlags::empty()).expect("recv"), 4);
    assert_eq!(&buf[..4], b"ping");
    assert_eq!(vfs.recv(a, &mut buf, MsgFlags::empty()).expect("recv"), 4);
    assert_eq!(&buf[..4], b"pong");
}

#[test]
fn socketpair_argument_validation() {
    let vfs = new_vfs();
    assert_eq!(
        vfs.socketpair(libc::AF_INET, libc::SOCK_STREAM, 0)
            .expect_err("inet")
            .errno(),
        Errno::AFNOSUPPORT
    );
    assert_eq!(
        vfs.socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 7)
            .expect_err("protocol")
            .errno(),
        Errno::OPNOTSUPP
    );
}

#[test]
fn inet_sockets_require_a_factory() {
    let vfs = new_vfs();
    assert_eq!(
        vfs.socket(libc::AF_INET, libc::SOCK_STREAM, 0)
            .expect_err("no factory")
            .errno(),
        Errno::AFNOSUPPORT
    );
    // The reserved descriptor was released on failure.
    let [fd, _] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    assert_eq!(fd, 3);
}

#[test]
fn abstract_socket_connect_accept_round_trip() {
    let vfs = new_vfs();
    let listener = vfs.socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).expect("socket");
    let addr = SocketAddress::Unix("@service".to_string());
    vfs.bind(listener, &addr).expect("bind");
    vfs.listen(listener, 8).expect("listen");

    let client = vfs.socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).expect("socket");
    vfs.connect(client, &addr).expect("connect");

    let (server, peer) = vfs.accept(listener).expect("accept");
    assert!(peer.is_some() || peer.is_none()); // client had no bound name
    vfs.send(client, b"hello", MsgFlags::empty()).expect("send");
    let mut buf = [0u8; 8];
    assert_eq!(vfs.recv(server, &mut buf, MsgFlags::empty()).expect("recv"), 5);
    assert_eq!(&buf[..5], b"hello");

    // The server's peer view names the bound address.
    assert_eq!(
        vfs.getsockname(server).expect("sockname"),
        SocketAddress::Unix("@service".to_string())
    );
    assert_eq!(
        vfs.getpeername(client).expect("peername"),
        SocketAddress::Unix("@service".to_string())
    );

    // Second bind of the same name while the listener lives: EADDRINUSE.
    let other = vfs.socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).expect("socket");
    assert_eq!(
        vfs.bind(other, &addr).expect_err("in use").errno(),
        Errno::ADDRINUSE
    );

    // Connecting to an unbound name is refused.
    assert_eq!(
        vfs.connect(other, &SocketAddress::Unix("@nobody".to_string()))
            .expect_err("refused")
            .errno(),
        Errno::CONNREFUSED
    );
}

#[test]
fn shutdown_write_produces_eof_on_the_peer() {
    let vfs = new_vfs();
    let [a, b] = vfs
        .socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0)
        .expect("socketpair");
    vfs.send(a, b"bye", MsgFlags::empty()).expect("send");
    vfs.shutdown(a, ShutdownHow::Write).expect("shutdown");

    let mut buf = [0u8; 8];
    assert_eq!(vfs.recv(b, &mut buf, MsgFlags::empty()).expect("recv"), 3);
    assert_eq!(vfs.recv(b, &mut buf, MsgFlags::empty()).expect("eof"), 0);
    assert_eq!(
        vfs.send(a, b"more", MsgFlags::empty()).expect_err("shut").errno(),
        Errno::PIPE
    );
}

#[test]
fn poll_reports_readiness_and_pollnval() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");

    let mut fds = [
        PollFd::new(read_fd, PollEvents::IN),
        PollFd::new(write_fd, PollEvents::OUT),
        PollFd::new(99, PollEvents::IN),
    ];
    let ready = vfs.poll(&mut fds, 0).expect("poll");
    // Write end is writable, unknown fd reports NVAL, empty read end no.
    assert_eq!(ready, 2);
    assert_eq!(fds[0].revents, PollEvents::empty());
    assert_eq!(fds[1].revents, PollEvents::OUT);
    assert_eq!(fds[2].revents, PollEvents::NVAL);

    vfs.write(write_fd, b"x").expect("write");
    let ready = vfs.poll(&mut fds, 0).expect("poll");
    assert_eq!(ready, 3);
    assert!(fds[0].revents.contains(PollEvents::IN));
}

#[test]
fn poll_times_out_when_nothing_happens() {
    let vfs = new_vfs();
    let [read_fd, _write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    let mut fds = [PollFd::new(read_fd, PollEvents::IN)];
    let started = Instant::now();
    let ready = vfs.poll(&mut fds, 50).expect("poll");
    assert_eq!(ready, 0);
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn poll_wakes_on_peer_close_with_hup() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    let closer_vfs = vfs.clone();
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        closer_vfs.close(write_fd).expect("close");
    });
    let mut fds = [PollFd::new(read_fd, PollEvents::IN)];
    let ready = vfs.poll(&mut fds, 5_000).expect("poll");
    assert_eq!(ready, 1);
    assert!(fds[0].revents.contains(PollEvents::HUP) || fds[0].revents.contains(PollEvents::IN));
    closer.join().expect("closer");
}

#[test]
fn select_with_zero_timeout_never_blocks() {
    let vfs = new_vfs();
    let [read_fd, _write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    let mut readfds = FdSet::new();
    readfds.set(read_fd);
    let mut timeout = Duration::ZERO;
    let started = Instant::now();
    let ready = vfs
        .select(read_fd + 1, Some(&mut readfds), None, None, Some(&mut timeout))
        .expect("select");
    assert_eq!(ready, 0);
    assert!(started.elapsed() < Duration::from_millis(20));
}

#[test]
fn select_clears_unready_descriptors_and_updates_the_timeout() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    vfs.write(write_fd, b"ready").expect("write");

    let mut readfds = FdSet::new();
    readfds.set(read_fd);
    let mut writefds = FdSet::new();
    writefds.set(write_fd);
    let mut timeout = Duration::from_millis(200);
    let ready = vfs
        .select(
            write_fd + 1,
            Some(&mut readfds),
            Some(&mut writefds),
            None,
            Some(&mut timeout),
        )
        .expect("select");
    assert_eq!(ready, 2);
    assert!(readfds.is_set(read_fd));
    assert!(writefds.is_set(write_fd));
    // Linux-style decrement.
    assert!(timeout <= Duration::from_millis(200));

    // Drain, then only the write side stays ready and the read bit clears.
    let mut buf = [0u8; 8];
    vfs.read(read_fd, &mut buf).expect("read");
    readfds.set(read_fd);
    let ready = vfs
        .select(
            write_fd + 1,
            Some(&mut readfds),
            Some(&mut writefds),
            None,
            Some(&mut Duration::ZERO),
        )
        .expect("select");
    assert_eq!(ready, 1);
    assert!(!readfds.is_set(read_fd));
    assert!(writefds.is_set(write_fd));
}

#[test]
fn select_times_out_without_events() {
    let vfs = new_vfs();
    let [read_fd, _write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    let mut readfds = FdSet::new();
    readfds.set(read_fd);
    let mut timeout = Duration::from_millis(50);
    let started = Instant::now();
    let ready = vfs
        .select(read_fd + 1, Some(&mut readfds), None, None, Some(&mut timeout))
        .expect("select");
    assert_eq!(ready, 0);
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert!(timeout <= Duration::from_millis(10));
}

#[test]
fn epoll_lifecycle_and_wait() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    let epfd = vfs.epoll_create1(0).expect("epoll_create1");

    let event = EpollEvent {
        events: EpollEvents::IN,
        data: 0xfeed,
    };
    vfs.epoll_ctl(epfd, EpollOp::Add, read_fd, Some(event)).expect("add");
    assert_eq!(
        vfs.epoll_ctl(epfd, EpollOp::Add, read_fd, Some(event))
            .expect_err("dup add")
            .errno(),
        Errno::EXIST
    );
    // A dup'd descriptor shares the registration.
    let dup_fd = vfs.dup(read_fd).expect("dup");
    assert_eq!(
        vfs.epoll_ctl(epfd, EpollOp::Add, dup_fd, Some(event))
            .expect_err("same stream")
            .errno(),
        Errno::EXIST
    );
    assert_eq!(
        vfs.epoll_ctl(epfd, EpollOp::Add, epfd, Some(event))
            .expect_err("self")
            .errno(),
        Errno::INVAL
    );

    let mut events = [EpollEvent::default(); 4];
    assert_eq!(vfs.epoll_wait(epfd, &mut events, 0).expect("wait"), 0);

    vfs.write(write_fd, b"wake").expect("write");
    let n = vfs.epoll_wait(epfd, &mut events, 0).expect("wait");
    assert_eq!(n, 1);
    assert!(events[0].events.contains(EpollEvents::IN));
    assert_eq!(events[0].data, 0xfeed);

    vfs.epoll_ctl(epfd, EpollOp::Del, read_fd, None).expect("del");
    assert_eq!(
        vfs.epoll_ctl(epfd, EpollOp::Mod, read_fd, Some(event))
            .expect_err("gone")
            .errno(),
        Errno::NOENT
    );
}

#[test]
fn epoll_wait_blocks_until_an_event() {
    let vfs = new_vfs();
    let [read_fd, write_fd] = vfs.pipe2(OpenFlags::RDONLY).expect("pipe2");
    let epfd = vfs.epoll_create1(0).expect("epoll_create1");
    vfs.epoll_ctl(
        epfd,
        EpollOp::Add,
        read_fd,
        Some(EpollEvent {
            events: EpollEvents::IN,
            data: 1,
        }),
    )
    .expect("add");

    let writer_vfs = vfs.clone();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        writer_vfs.write(write_fd, b"x").expect("write");
    });

    let mut events = [EpollEvent::default(); 2];
    let n = vfs.epoll_wait(epfd, &mut events, 5_000).expect("wait");
    assert_eq!(n, 1);
    writer.join().expect("writer");
}

#[test]
fn blocking_accept_waits_for_a_connection() {
    let vfs = new_vfs();
    let listener = vfs.socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).expect("socket");
    let addr = SocketAddress::Unix("@late".to_string());
    vfs.bind(listener, &addr).expect("bind");
    vfs.listen(listener, 1).expect("listen");

    let connector_vfs = vfs.clone();
    let connector = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        let client = connector_vfs
            .socket(libc::AF_UNIX, libc::SOCK_STREAM, 0)
            .expect("socket");
        connector_vfs
            .connect(client, &SocketAddress::Unix("@late".to_string()))
            .expect("connect");
        connector_vfs.send(client, b"hi", MsgFlags::empty()).expect("send");
    });

    let (server, _addr) = vfs.accept(listener).expect("accept");
    let mut buf = [0u8; 4];
    assert_eq!(vfs.recv(server, &mut buf, MsgFlags::empty()).expect("recv"), 2);
    connector.join().expect("connector");
}
