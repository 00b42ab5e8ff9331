//! Pipe semantics exercised through the syscall interface: creation in
//! the shared descriptor space, FIFO transfer, fork-duplicated ends,
//! blocking and wakeup, and the capacity boundary.

mod common;

use common::{SyscallStatus, TestOs};
use ferrite_kernel::{
    error::PipeError,
    process::{Pid, ProcessState},
    syscall::Syscall,
};

#[test]
fn pipe_through_fork_delivers_the_message() {
    let mut os = TestOs::new();
    let parent = os.spawn("parent");

    // pipe(&fds)
    let fds_ptr = os.user_buf(parent, 16);
    assert_eq!(
        os.syscall(parent, Syscall::Pipe, [fds_ptr, 0, 0, 0, 0]).value(),
        0
    );
    let read_fd = os.peek_u64(parent, fds_ptr);
    let write_fd = os.peek_u64(parent, fds_ptr + 8);
    assert_ne!(read_fd, write_fd);

    // fork()
    let child = Pid(os.syscall(parent, Syscall::Fork, [0; 5]).value() as u64);
    assert!(child.0 > parent.0);

    // Parent writes 13 bytes and closes both ends.
    let msg = b"Merhaba pipe!";
    let wbuf = os.user_buf(parent, msg.len());
    os.poke(parent, wbuf, msg);
    assert_eq!(
        os.syscall(parent, Syscall::Write, [write_fd, wbuf, msg.len() as u64, 0, 0])
            .value(),
        13
    );
    assert_eq!(os.syscall(parent, Syscall::Close, [read_fd, 0, 0, 0, 0]).value(), 0);
    assert_eq!(os.syscall(parent, Syscall::Close, [write_fd, 0, 0, 0, 0]).value(), 0);

    // Child closes its write end and reads into a 63-byte buffer.
    assert_eq!(os.syscall(child, Syscall::Close, [write_fd, 0, 0, 0, 0]).value(), 0);
    let rbuf = os.user_buf(child, 63);
    let n = os
        .syscall(child, Syscall::Read, [read_fd, rbuf, 63, 0, 0])
        .value();
    assert_eq!(n, 13);
    assert_eq!(&os.peek(child, rbuf, 13), msg);

    // All writers are gone now: EOF.
    assert_eq!(
        os.syscall(child, Syscall::Read, [read_fd, rbuf, 63, 0, 0]).value(),
        0
    );
}

#[test]
fn empty_pipe_blocks_reader_until_writer_commits() {
    let mut os = TestOs::new();
    let parent = os.spawn("parent");
    let fds_ptr = os.user_buf(parent, 16);
    os.syscall(parent, Syscall::Pipe, [fds_ptr, 0, 0, 0, 0]).value();
    let read_fd = os.peek_u64(parent, fds_ptr);
    let write_fd = os.peek_u64(parent, fds_ptr + 8);

    let child = Pid(os.syscall(parent, Syscall::Fork, [0; 5]).value() as u64);

    // Child blocks on the empty pipe.
    let rbuf = os.user_buf(child, 32);
    assert_eq!(
        os.syscall(child, Syscall::Read, [read_fd, rbuf, 32, 0, 0]),
        SyscallStatus::Blocked
    );
    assert_eq!(os.state(child), Some(ProcessState::Blocked));

    // Parent writes; the committed transfer wakes exactly one waiter.
    let wbuf = os.user_buf(parent, 5);
    os.poke(parent, wbuf, b"hello");
    assert_eq!(
        os.syscall(parent, Syscall::Write, [write_fd, wbuf, 5, 0, 0]).value(),
        5
    );
    assert_eq!(os.state(child), Some(ProcessState::Ready));

    // The restarted read sees the data.
    assert_eq!(os.restart_syscall(child).value(), 5);
    assert_eq!(&os.peek(child, rbuf, 5), b"hello");
}

#[test]
fn full_pipe_blocks_writer_and_resumes_with_progress() {
    let mut os = TestOs::new();
    let parent = os.spawn("parent");
    let fds_ptr = os.user_buf(parent, 16);
    os.syscall(parent, Syscall::Pipe, [fds_ptr, 0, 0, 0, 0]).value();
    let read_fd = os.peek_u64(parent, fds_ptr);
    let write_fd = os.peek_u64(parent, fds_ptr + 8);
    let child = Pid(os.syscall(parent, Syscall::Fork, [0; 5]).value() as u64);

    // Exactly capacity bytes fit without a reader draining anything.
    let payload = vec![0x5Au8; 4096 + 100];
    let wbuf = os.user_buf(parent, payload.len());
    os.poke(parent, wbuf, &payload);
    assert_eq!(
        os.syscall(parent, Syscall::Write, [write_fd, wbuf, 4096, 0, 0]).value(),
        4096
    );

    // The next write does not fit at all: the writer parks.
    let extra = os.user_buf(parent, 100);
    os.poke(parent, extra, &payload[..100]);
    assert_eq!(
        os.syscall(parent, Syscall::Write, [write_fd, extra, 100, 0, 0]),
        SyscallStatus::Blocked
    );
    assert_eq!(os.state(parent), Some(ProcessState::Blocked));

    // Child drains; the writer wakes and completes on restart.
    let rbuf = os.user_buf(child, 4096);
    assert_eq!(
        os.syscall(child, Syscall::Read, [read_fd, rbuf, 4096, 0, 0]).value(),
        4096
    );
    assert_eq!(os.state(parent), Some(ProcessState::Ready));
    assert_eq!(os.restart_syscall(parent).value(), 100);

    // FIFO order across the boundary.
    assert_eq!(
        os.syscall(child, Syscall::Read, [read_fd, rbuf, 4096, 0, 0]).value(),
        100
    );
    assert_eq!(os.peek(child, rbuf, 100), payload[..100].to_vec());
}

#[test]
fn writing_after_reader_closes_is_a_broken_pipe() {
    let mut os = TestOs::new();
    let parent = os.spawn("parent");
    let fds_ptr = os.user_buf(parent, 16);
    os.syscall(parent, Syscall::Pipe, [fds_ptr, 0, 0, 0, 0]).value();
    let read_fd = os.peek_u64(parent, fds_ptr);
    let write_fd = os.peek_u64(parent, fds_ptr + 8);

    assert_eq!(os.syscall(parent, Syscall::Close, [read_fd, 0, 0, 0, 0]).value(), 0);
    let wbuf = os.user_buf(parent, 4);
    os.poke(parent, wbuf, b"data");
    assert_eq!(
        os.syscall(parent, Syscall::Write, [write_fd, wbuf, 4, 0, 0]).value(),
        PipeError::Closed.code() as i64
    );
}

#[test]
fn blocked_reader_is_interrupted_by_a_signal() {
    use ferrite_kernel::process::signals::{self, SIGUSR1, SIG_IGN};

    let mut os = TestOs::new();
    let parent = os.spawn("parent");
    let fds_ptr = os.user_buf(parent, 16);
    os.syscall(parent, Syscall::Pipe, [fds_ptr, 0, 0, 0, 0]).value();
    let read_fd = os.peek_u64(parent, fds_ptr);

    let rbuf = os.user_buf(parent, 16);
    assert_eq!(
        os.syscall(parent, Syscall::Read, [read_fd, rbuf, 16, 0, 0]),
        SyscallStatus::Blocked
    );

    // An ignored-but-deliverable signal still wakes the sleeper; the
    // restarted call surfaces the interruption.
    {
        let p = os.kernel.processes.get_mut(parent).unwrap();
        signals::set_handler(p, SIGUSR1, SIG_IGN).unwrap();
    }
    signals::send(&mut os.kernel, parent, SIGUSR1).unwrap();
    assert_eq!(os.state(parent), Some(ProcessState::Ready));
    assert_eq!(os.restart_syscall(parent).value(), -1);
}

#[test]
fn bad_user_pointer_is_rejected_before_any_transfer() {
    let mut os = TestOs::new();
    let parent = os.spawn("parent");
    let fds_ptr = os.user_buf(parent, 16);
    os.syscall(parent, Syscall::Pipe, [fds_ptr, 0, 0, 0, 0]).value();
    let write_fd = os.peek_u64(parent, fds_ptr + 8);

    // Unmapped buffer.
    assert_eq!(
        os.syscall(parent, Syscall::Write, [write_fd, 0x7000_0000, 8, 0, 0]).value(),
        -1
    );
    // Kernel-half buffer.
    assert_eq!(
        os.syscall(
            parent,
            Syscall::Write,
            [write_fd, 0xFFFF_FFFF_8000_0000, 8, 0, 0]
        )
        .value(),
        -1
    );
}
