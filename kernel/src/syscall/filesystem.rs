//! File, pipe and terminal system calls
//!
//! `read`, `write` and `close` dispatch on the tagged descriptor table:
//! pipes, FAT32 files, the terminal (fd 1/2) and the keyboard (fd 0)
//! share one descriptor space. All user buffers are bounced through
//! kernel memory with validated copies.

use alloc::string::String;
use alloc::vec;

use super::{current_space, Outcome, IO_CHUNK_MAX};
use crate::{
    error::{KernelError, PipeError},
    fs::{
        pipe::{PipeId, ReadOutcome, WriteOutcome},
        OpenFlags,
    },
    kernel::Kernel,
    mm::user_access,
    process::{lifecycle, scheduler, Descriptor, MAX_FDS},
};

fn descriptor_at(kernel: &Kernel, fd: u64) -> Option<Descriptor> {
    if fd as usize >= MAX_FDS {
        return None;
    }
    kernel.processes.current().map(|p| p.fds[fd as usize])
}

/// Read from a descriptor into a user buffer.
pub fn sys_read(kernel: &mut Kernel, fd: u64, buf_ptr: u64, count: u64) -> Outcome {
    let Some(descriptor) = descriptor_at(kernel, fd) else {
        return Outcome::Complete(-1);
    };
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    let count = (count as usize).min(IO_CHUNK_MAX);
    if !kernel.vmm.validate_user(&space, buf_ptr, count, true) {
        return Outcome::Complete(-1);
    }

    match descriptor {
        Descriptor::Keyboard => read_keyboard(kernel, buf_ptr, count),
        Descriptor::PipeRead { pipe, nonblock } => {
            read_pipe(kernel, pipe, nonblock, buf_ptr, count)
        }
        Descriptor::File { slot } => {
            let mut kbuf = vec![0u8; count];
            let n = {
                let Some(open) = kernel.files.get_mut(slot) else {
                    return Outcome::Complete(-1);
                };
                let mut file = open.file.clone();
                let Some(fs) = kernel.fs.as_mut() else {
                    return Outcome::Complete(crate::error::FsError::NotMounted.code());
                };
                match fs.read(&mut file, &mut kbuf) {
                    Ok(n) => {
                        // Write the advanced position back to the shared
                        // open file.
                        if let Some(open) = kernel.files.get_mut(slot) {
                            open.file = file;
                        }
                        n
                    }
                    Err(e) => return Outcome::Complete(e.code()),
                }
            };
            if n > 0 {
                let space = match current_space(kernel) {
                    Some(s) => s,
                    None => return Outcome::Complete(-1),
                };
                if !user_access::copy_to_user(&kernel.vmm, &space, buf_ptr, &kbuf[..n]) {
                    return Outcome::Complete(-1);
                }
            }
            Outcome::Complete(n as isize)
        }
        _ => Outcome::Complete(-1),
    }
}

fn read_pipe(
    kernel: &mut Kernel,
    pipe: PipeId,
    nonblock: bool,
    buf_ptr: u64,
    count: usize,
) -> Outcome {
    let Some(pid) = kernel.processes.current_pid() else {
        return Outcome::Complete(-1);
    };
    let mut kbuf = vec![0u8; count.min(crate::fs::pipe::PIPE_CAPACITY)];
    match kernel.pipes.try_read(pipe, &mut kbuf) {
        Ok(ReadOutcome::Data(n)) => {
            let Some(space) = current_space(kernel) else {
                return Outcome::Complete(-1);
            };
            if !user_access::copy_to_user(&kernel.vmm, &space, buf_ptr, &kbuf[..n]) {
                return Outcome::Complete(-1);
            }
            if let Some(writer) = kernel.pipes.pop_write_waiter(pipe) {
                scheduler::unblock_process(&mut kernel.processes, writer);
            }
            Outcome::Complete(n as isize)
        }
        Ok(ReadOutcome::Eof) => Outcome::Complete(0),
        Ok(ReadOutcome::WouldBlock) => {
            if nonblock {
                return Outcome::Complete(PipeError::Empty.code());
            }
            let interrupted = kernel
                .processes
                .get(pid)
                .is_some_and(|p| p.has_deliverable_signal());
            if interrupted {
                return Outcome::Complete(KernelError::Interrupted.code());
            }
            kernel.pipes.push_read_waiter(pipe, pid);
            scheduler::block_process(&mut kernel.processes, pid);
            Outcome::Block
        }
        Err(e) => Outcome::Complete(e.code()),
    }
}

fn write_pipe(
    kernel: &mut Kernel,
    pipe: PipeId,
    nonblock: bool,
    buf_ptr: u64,
    count: usize,
) -> Outcome {
    let Some(pid) = kernel.processes.current_pid() else {
        return Outcome::Complete(-1);
    };
    if count == 0 {
        return Outcome::Complete(0);
    }

    // Bytes already committed by earlier attempts of this (restarted)
    // write.
    let progress = kernel
        .processes
        .get(pid)
        .map(|p| p.restart_progress.min(count))
        .unwrap_or(0);
    let remaining = count - progress;
    if remaining == 0 {
        return Outcome::Complete(count as isize);
    }

    let mut kbuf = vec![0u8; remaining];
    {
        let Some(space) = current_space(kernel) else {
            return Outcome::Complete(-1);
        };
        if !user_access::copy_from_user(&kernel.vmm, &space, &mut kbuf, buf_ptr + progress as u64) {
            return Outcome::Complete(-1);
        }
    }

    match kernel.pipes.try_write(pipe, &kbuf) {
        Ok(WriteOutcome::Wrote(n)) => {
            if let Some(reader) = kernel.pipes.pop_read_waiter(pipe) {
                scheduler::unblock_process(&mut kernel.processes, reader);
            }
            let total = progress + n;
            if total == count {
                Outcome::Complete(count as isize)
            } else if nonblock {
                Outcome::Complete(total as isize)
            } else {
                if let Some(p) = kernel.processes.get_mut(pid) {
                    p.restart_progress = total;
                }
                kernel.pipes.push_write_waiter(pipe, pid);
                scheduler::block_process(&mut kernel.processes, pid);
                Outcome::Block
            }
        }
        Ok(WriteOutcome::WouldBlock) => {
            if nonblock {
                if progress > 0 {
                    return Outcome::Complete(progress as isize);
                }
                return Outcome::Complete(PipeError::Full.code());
            }
            let interrupted = kernel
                .processes
                .get(pid)
                .is_some_and(|p| p.has_deliverable_signal());
            if interrupted {
                if progress > 0 {
                    return Outcome::Complete(progress as isize);
                }
                return Outcome::Complete(KernelError::Interrupted.code());
            }
            if let Some(p) = kernel.processes.get_mut(pid) {
                p.restart_progress = progress;
            }
            kernel.pipes.push_write_waiter(pipe, pid);
            scheduler::block_process(&mut kernel.processes, pid);
            Outcome::Block
        }
        // The reader vanished mid-transfer: report what was committed,
        // or the closed error when nothing was.
        Err(e) => {
            if progress > 0 {
                Outcome::Complete(progress as isize)
            } else {
                Outcome::Complete(e.code())
            }
        }
    }
}

#[cfg(target_os = "none")]
fn read_keyboard(kernel: &mut Kernel, buf_ptr: u64, count: usize) -> Outcome {
    let mut kbuf = vec![0u8; count];
    let n = crate::drivers::keyboard::read_line(&mut kbuf);
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    if n > 0 && !user_access::copy_to_user(&kernel.vmm, &space, buf_ptr, &kbuf[..n]) {
        return Outcome::Complete(-1);
    }
    Outcome::Complete(n as isize)
}

/// The host build has no keyboard; reads from fd 0 return 0 bytes.
#[cfg(not(target_os = "none"))]
fn read_keyboard(_kernel: &mut Kernel, _buf_ptr: u64, _count: usize) -> Outcome {
    Outcome::Complete(0)
}

/// Write from a user buffer to a descriptor.
pub fn sys_write(kernel: &mut Kernel, fd: u64, buf_ptr: u64, count: u64) -> Outcome {
    let Some(descriptor) = descriptor_at(kernel, fd) else {
        return Outcome::Complete(-1);
    };
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    let count = (count as usize).min(IO_CHUNK_MAX);
    if !kernel.vmm.validate_user(&space, buf_ptr, count, false) {
        return Outcome::Complete(-1);
    }

    match descriptor {
        Descriptor::Terminal => {
            let mut kbuf = vec![0u8; count];
            if !user_access::copy_from_user(&kernel.vmm, &space, &mut kbuf, buf_ptr) {
                return Outcome::Complete(-1);
            }
            print!("{}", String::from_utf8_lossy(&kbuf));
            Outcome::Complete(count as isize)
        }
        Descriptor::PipeWrite { pipe, nonblock } => {
            write_pipe(kernel, pipe, nonblock, buf_ptr, count)
        }
        Descriptor::File { slot } => {
            let mut kbuf = vec![0u8; count];
            if !user_access::copy_from_user(&kernel.vmm, &space, &mut kbuf, buf_ptr) {
                return Outcome::Complete(-1);
            }
            let Some(open) = kernel.files.get_mut(slot) else {
                return Outcome::Complete(-1);
            };
            let mut file = open.file.clone();
            let Some(fs) = kernel.fs.as_mut() else {
                return Outcome::Complete(crate::error::FsError::NotMounted.code());
            };
            match fs.write(&mut file, &kbuf) {
                Ok(n) => {
                    if let Some(open) = kernel.files.get_mut(slot) {
                        open.file = file;
                    }
                    Outcome::Complete(n as isize)
                }
                Err(e) => Outcome::Complete(e.code()),
            }
        }
        _ => Outcome::Complete(-1),
    }
}

/// Open a path on the mounted volume, optionally creating it.
pub fn sys_open(kernel: &mut Kernel, path_ptr: u64, flags: u64) -> Outcome {
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    let Some(path) = user_access::copy_cstr_from_user(&kernel.vmm, &space, path_ptr) else {
        return Outcome::Complete(-1);
    };
    let flags = OpenFlags::from_bits_truncate(flags);

    let file = {
        let fs = match kernel.fs.as_mut() {
            Some(fs) => fs,
            None => return Outcome::Complete(crate::error::FsError::NotMounted.code()),
        };
        match fs.open(&path) {
            Ok(f) if f.entry.is_dir => return Outcome::Complete(-1),
            Ok(mut f) => {
                if flags.contains(OpenFlags::APPEND) {
                    let size = f.entry.size;
                    if fs.seek(&mut f, size).is_err() {
                        return Outcome::Complete(-1);
                    }
                }
                f
            }
            Err(crate::error::FsError::NotFound) if flags.contains(OpenFlags::CREATE) => {
                match fs.create(&path) {
                    Ok(f) => f,
                    Err(e) => return Outcome::Complete(e.code()),
                }
            }
            Err(e) => return Outcome::Complete(e.code()),
        }
    };

    let slot = match kernel.files.insert(file) {
        Ok(slot) => slot,
        Err(e) => return Outcome::Complete(e.code()),
    };
    let Some(p) = kernel.processes.current_mut() else {
        let _ = kernel.files.close(slot);
        return Outcome::Complete(-1);
    };
    match p.free_fd() {
        Some(fd) => {
            p.fds[fd] = Descriptor::File { slot };
            Outcome::Complete(fd as isize)
        }
        None => {
            let _ = kernel.files.close(slot);
            Outcome::Complete(-1)
        }
    }
}

/// Close a descriptor of any kind.
pub fn sys_close(kernel: &mut Kernel, fd: u64) -> Outcome {
    if fd as usize >= MAX_FDS {
        return Outcome::Complete(-1);
    }
    let Some(p) = kernel.processes.current_mut() else {
        return Outcome::Complete(-1);
    };
    let descriptor = p.fds[fd as usize];
    if descriptor == Descriptor::None {
        return Outcome::Complete(-1);
    }
    p.fds[fd as usize] = Descriptor::None;
    lifecycle::close_descriptor(kernel, descriptor);
    Outcome::Complete(0)
}

/// Create a pipe and store `[read_fd, write_fd]` (two u64 values) at the
/// user pointer.
pub fn sys_pipe(kernel: &mut Kernel, fds_ptr: u64) -> Outcome {
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    if !kernel.vmm.validate_user(&space, fds_ptr, 16, true) {
        return Outcome::Complete(-1);
    }

    let id = match kernel.pipes.create() {
        Ok(id) => id,
        Err(e) => return Outcome::Complete(e.code()),
    };

    let free_pair = kernel.processes.current().map(|p| {
        let mut free = p
            .fds
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == Descriptor::None)
            .map(|(i, _)| i);
        (free.next(), free.next())
    });
    let (read_fd, write_fd) = match free_pair {
        Some((Some(read_fd), Some(write_fd))) => (read_fd, write_fd),
        _ => {
            drop_pipe(kernel, id);
            return Outcome::Complete(-1);
        }
    };
    if let Some(p) = kernel.processes.current_mut() {
        p.fds[read_fd] = Descriptor::PipeRead {
            pipe: id,
            nonblock: false,
        };
        p.fds[write_fd] = Descriptor::PipeWrite {
            pipe: id,
            nonblock: false,
        };
    }

    if !user_access::put_user_u64(&kernel.vmm, &space, fds_ptr, read_fd as u64)
        || !user_access::put_user_u64(&kernel.vmm, &space, fds_ptr + 8, write_fd as u64)
    {
        if let Some(p) = kernel.processes.current_mut() {
            p.fds[read_fd] = Descriptor::None;
            p.fds[write_fd] = Descriptor::None;
        }
        drop_pipe(kernel, id);
        return Outcome::Complete(-1);
    }
    Outcome::Complete(0)
}

fn drop_pipe(kernel: &mut Kernel, id: PipeId) {
    kernel.pipes.close_read(id);
    kernel.pipes.close_write(id);
}

/// Create a directory on the volume. The mode argument is accepted for
/// ABI shape; FAT32 has no permission bits.
pub fn sys_mkdir(kernel: &mut Kernel, path_ptr: u64, _mode: u64) -> Outcome {
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    let Some(path) = user_access::copy_cstr_from_user(&kernel.vmm, &space, path_ptr) else {
        return Outcome::Complete(-1);
    };
    let fs = match kernel.fs.as_mut() {
        Some(fs) => fs,
        None => return Outcome::Complete(crate::error::FsError::NotMounted.code()),
    };
    match fs.mkdir(&path) {
        Ok(()) => Outcome::Complete(0),
        Err(e) => Outcome::Complete(e.code()),
    }
}

/// Remove an empty directory from the volume.
pub fn sys_rmdir(kernel: &mut Kernel, path_ptr: u64) -> Outcome {
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    let Some(path) = user_access::copy_cstr_from_user(&kernel.vmm, &space, path_ptr) else {
        return Outcome::Complete(-1);
    };
    let fs = match kernel.fs.as_mut() {
        Some(fs) => fs,
        None => return Outcome::Complete(crate::error::FsError::NotMounted.code()),
    };
    match fs.rmdir(&path) {
        Ok(()) => Outcome::Complete(0),
        Err(e) => Outcome::Complete(e.code()),
    }
}
