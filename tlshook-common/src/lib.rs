#![no_std]

/// Key of the `offsets_data` map: identifies a binary by the device and
/// inode of its executable file.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TlsBinaryId {
    pub id_major: u32,
    pub id_minor: u32,
    pub ino: u64,
}

/// Struct field offsets the uprobe programs need to walk from a
/// `*tls.Conn` down to the socket file descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsOffsetsData {
    pub tls_conn_inner_conn: u64,
    pub tcp_conn_inner_conn: u64,
    pub conn_fd: u64,
    pub net_fd_pfd: u64,
    pub fd_sysfd: u64,
    /// Number of return uprobes installed on `Read`.
    pub read_return_count: u32,
    /// Number of return uprobes installed on `Write`.
    pub write_return_count: u32,
}

pub const PROCESS_EVENT_EXEC: u32 = 0;
pub const PROCESS_EVENT_EXIT: u32 = 1;

/// Emitted on `sched_process_exec` and `sched_process_exit`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProcessEvent {
    pub pid: u32,
    pub kind: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TlsBinaryId {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for TlsOffsetsData {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ProcessEvent {}
