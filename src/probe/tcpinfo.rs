//! Kernel TCP statistics for an established connection.
//!
//! On Linux this is a `getsockopt(TCP_INFO)` query. Other platforms report a
//! zero-valued [`KernelStats`], which is a valid result rather than an error.

use tokio::net::TcpStream;

use super::ProbeError;

/// Snapshot of the kernel's per-connection TCP state.
///
/// Timers are in microseconds, `last_*` ages in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,
    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,
    pub pmtu: u32,
    pub rcv_ssthresh: u32,
    pub rtt: u32,
    pub rttvar: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub reordering: u32,
    pub rcv_rtt: u32,
    pub rcv_space: u32,
    pub total_retrans: u32,
}

/// Query kernel statistics for `stream`.
#[cfg(target_os = "linux")]
pub fn connection_stats(stream: &TcpStream) -> Result<KernelStats, ProbeError> {
    use std::os::fd::AsRawFd;
    linux::tcp_info(stream.as_raw_fd())
}

/// Query kernel statistics for `stream`.
#[cfg(not(target_os = "linux"))]
pub fn connection_stats(_stream: &TcpStream) -> Result<KernelStats, ProbeError> {
    Ok(KernelStats::default())
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{KernelStats, ProbeError};
    use std::mem;
    use std::os::fd::RawFd;

    /// Leading, stable part of `struct tcp_info` from `<linux/tcp.h>`.
    ///
    /// The kernel copies `min(optlen, sizeof(struct tcp_info))` bytes, so
    /// newer kernels with a longer struct fill this prefix unchanged.
    #[repr(C)]
    #[derive(Default)]
    struct RawTcpInfo {
        state: u8,
        ca_state: u8,
        retransmits: u8,
        probes: u8,
        backoff: u8,
        options: u8,
        wscale: u8,
        flags: u8,

        rto: u32,
        ato: u32,
        snd_mss: u32,
        rcv_mss: u32,

        unacked: u32,
        sacked: u32,
        lost: u32,
        retrans: u32,
        fackets: u32,

        last_data_sent: u32,
        last_ack_sent: u32,
        last_data_recv: u32,
        last_ack_recv: u32,

        pmtu: u32,
        rcv_ssthresh: u32,
        rtt: u32,
        rttvar: u32,
        snd_ssthresh: u32,
        snd_cwnd: u32,
        advmss: u32,
        reordering: u32,

        rcv_rtt: u32,
        rcv_space: u32,

        total_retrans: u32,
    }

    pub(super) fn tcp_info(fd: RawFd) -> Result<KernelStats, ProbeError> {
        let mut raw = RawTcpInfo::default();
        let mut len = mem::size_of::<RawTcpInfo>() as libc::socklen_t;

        // SAFETY: `raw` is a plain repr(C) struct of integers and `len` is its
        // exact size; the kernel writes at most `len` bytes into it.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut raw as *mut RawTcpInfo as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(ProbeError::Extraction(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        Ok(KernelStats {
            ca_state: raw.ca_state,
            retransmits: raw.retransmits,
            probes: raw.probes,
            backoff: raw.backoff,
            options: raw.options,
            rto: raw.rto,
            ato: raw.ato,
            snd_mss: raw.snd_mss,
            rcv_mss: raw.rcv_mss,
            unacked: raw.unacked,
            sacked: raw.sacked,
            lost: raw.lost,
            retrans: raw.retrans,
            fackets: raw.fackets,
            last_data_sent: raw.last_data_sent,
            last_ack_sent: raw.last_ack_sent,
            last_data_recv: raw.last_data_recv,
            last_ack_recv: raw.last_ack_recv,
            pmtu: raw.pmtu,
            rcv_ssthresh: raw.rcv_ssthresh,
            rtt: raw.rtt,
            rttvar: raw.rttvar,
            snd_ssthresh: raw.snd_ssthresh,
            snd_cwnd: raw.snd_cwnd,
            advmss: raw.advmss,
            reordering: raw.reordering,
            rcv_rtt: raw.rcv_rtt,
            rcv_space: raw.rcv_space,
            total_retrans: raw.total_retrans,
        })
    }

}
