//! Persisted core state.
//!
//! A snapshot carries every register, every enumerated CSR (by raw id) and
//! both TLB pools entry for entry, including the replacement generator, so a
//! restored guest sees exactly the translations it had. The serialized form
//! is bincode wrapped in a small envelope with a SHA-256 digest of the
//! payload; restore refuses anything whose digest does not match.

use crate::cpu::timer::ConstantTimer;
use crate::cpu::csr::CsrFile;
use crate::cpu::{CpuState, NUM_FCC, NUM_FPRS, NUM_GPRS};
use crate::error::{CoreError, CoreResult};
use crate::mmu::tlb::{Tlb, TlbEntry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"LA64";
pub const SNAPSHOT_VERSION: u32 = 1;

/// State exchanged at context-switch points and written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSnapshot {
    pub core_id: u32,
    pub pc: u64,
    pub gpr: [u64; NUM_GPRS],
    pub fpr: [u64; NUM_FPRS],
    pub fcc: [bool; NUM_FCC],
    pub fcsr0: u32,
    /// (raw CSR id, value) for every enumerated CSR
    pub csrs: Vec<(u16, u64)>,
    pub tlb: Tlb,
    pub timer: ConstantTimer,
    pub lladdr: u64,
    pub llval: u64,
    pub icount: u64,
    pub idle: bool,
}

impl CoreSnapshot {
    /// FTLB slots followed by VTLB slots, in unified TLBIDX order.
    pub fn tlb_entries(&self) -> impl Iterator<Item = &TlbEntry> + '_ {
        self.tlb
            .ftlb_entries()
            .iter()
            .chain(self.tlb.vtlb_entries().iter())
    }

    pub fn csr(&self, raw: u16) -> Option<u64> {
        self.csrs.iter().find(|(id, _)| *id == raw).map(|(_, v)| *v)
    }

    /// Serialize with the digest envelope.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let digest = Sha256::digest(&payload).to_vec();
        let file = SnapshotFile {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            digest,
            payload,
        };
        Ok(bincode::serialize(&file)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let file: SnapshotFile = bincode::deserialize(bytes)?;
        if file.magic != SNAPSHOT_MAGIC {
            return Err(CoreError::Snapshot("bad magic".into()));
        }
        if file.version != SNAPSHOT_VERSION {
            return Err(CoreError::Snapshot(format!(
                "unsupported version {} (expected {})",
                file.version, SNAPSHOT_VERSION
            )));
        }
        let digest = Sha256::digest(&file.payload);
        if digest.as_slice() != file.digest.as_slice() {
            return Err(CoreError::Snapshot(format!(
                "digest mismatch (stored {}, computed {})",
                hex::encode(&file.digest),
                hex::encode(digest)
            )));
        }
        Ok(bincode::deserialize(&file.payload)?)
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    magic: [u8; 4],
    version: u32,
    #[serde(with = "serde_bytes")]
    digest: Vec<u8>,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl CpuState {
    pub fn export_state(&self) -> CoreSnapshot {
        CoreSnapshot {
            core_id: self.config.core_id,
            pc: self.pc,
            gpr: self.gpr,
            fpr: self.fpr,
            fcc: self.fcc,
            fcsr0: self.fcsr0,
            csrs: self.csr.iter().map(|(id, v)| (id.raw(), v)).collect(),
            tlb: self.tlb.clone(),
            timer: self.timer.clone(),
            lladdr: self.lladdr,
            llval: self.llval,
            icount: self.icount,
            idle: self.idle,
        }
    }

    /// Replace the architectural state with `snap`. The TLB geometry must
    /// match this core's configuration. All cached translations become
    /// stale.
    pub fn import_state(&mut self, snap: &CoreSnapshot) -> CoreResult<()> {
        let tlb = &snap.tlb;
        if tlb.sets() != self.config.ftlb_sets
            || tlb.ways() != self.config.ftlb_ways
            || tlb.vtlb_len() != self.config.vtlb_entries
        {
            return Err(CoreError::Snapshot(format!(
                "TLB geometry {}x{}+{} does not match core {}x{}+{}",
                tlb.sets(),
                tlb.ways(),
                tlb.vtlb_len(),
                self.config.ftlb_sets,
                self.config.ftlb_ways,
                self.config.vtlb_entries
            )));
        }
        let expected = tlb.sets() * tlb.ways();
        if tlb.ftlb_len() != expected {
            log::error!("[CPU] Snapshot holds {} FTLB entries, expected {}", tlb.ftlb_len(), expected);
            return Err(CoreError::InvalidTlbIndex(tlb.ftlb_len()));
        }
        let csr = CsrFile::from_pairs(&snap.csrs)?;

        self.pc = snap.pc;
        self.gpr = snap.gpr;
        self.gpr[0] = 0;
        self.fpr = snap.fpr;
        self.fcc = snap.fcc;
        self.fcsr0 = snap.fcsr0;
        self.csr = csr;
        self.tlb = snap.tlb.clone();
        self.timer = snap.timer.clone();
        self.lladdr = snap.lladdr;
        self.llval = snap.llval;
        self.icount = snap.icount;
        self.idle = snap.idle;
        self.compute_hflags();
        self.request_tb_flush();
        log::debug!(
            "[CPU] Core {} state imported, pc={:#x}, {} TLB entries present",
            self.config.core_id,
            self.pc,
            self.tlb.present_count()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::cpu::HFlags;
    use crate::cpu::csr::*;
    use crate::cpu::test_support::make_test_cpu;
    use crate::mmu::tlb::{TlbIndex, VtlbIndex};

    fn busy_cpu() -> CpuState {
        let mut cpu = make_test_cpu();
        cpu.pc = 0x9000_0000_0000_1234;
        cpu.gpr[4] = 0xdead_beef;
        cpu.fpr[7] = 0x4000_0000_0000_0000;
        cpu.fcc[3] = true;
        cpu.csr.set(CsrId::Crmd, CRMD_PG | 3);
        cpu.csr.set(CsrId::Asid, 0x2a);
        cpu.csr.set(CsrId::Eentry, 0x8000);
        cpu.tlb.set_entry(
            TlbIndex::Vtlb(VtlbIndex(2)),
            TlbEntry {
                vppn: 0x1234,
                ps: 12,
                asid: 0x2a,
                global: false,
                present: true,
                lo: [TLBELO_V | TLBELO_D, 0],
            },
        );
        cpu.compute_hflags();
        cpu
    }

    #[test]
    fn test_export_import_roundtrip() {
        let cpu = busy_cpu();
        let snap = cpu.export_state();
        assert_eq!(snap.csr(CsrId::Asid.raw()), Some(0x2a));
        assert_eq!(snap.tlb_entries().filter(|e| e.present).count(), 1);

        let mut other = make_test_cpu();
        other.take_tb_flush();
        other.import_state(&snap).unwrap();
        assert_eq!(other.pc, cpu.pc);
        assert_eq!(other.gpr, cpu.gpr);
        assert_eq!(other.fpr, cpu.fpr);
        assert_eq!(other.fcc, cpu.fcc);
        assert_eq!(other.csr, cpu.csr);
        assert_eq!(other.tlb, cpu.tlb);
        assert_eq!(other.hflags.plv(), 3);
        assert!(other.hflags.contains(HFlags::PG));
        assert!(other.take_tb_flush());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let snap = busy_cpu().export_state();
        let bytes = snap.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"LA64");
        let back = CoreSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let snap = busy_cpu().export_state();
        let mut bytes = snap.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = CoreSnapshot::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = busy_cpu().export_state().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(CoreSnapshot::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let snap = busy_cpu().export_state();
        let mut cpu = CpuState::new(CoreConfig::default()).unwrap();
        let err = cpu.import_state(&snap).unwrap_err();
        assert!(matches!(err, CoreError::Snapshot(_)));
    }

    #[test]
    fn test_missing_csr_rejected() {
        let mut snap = busy_cpu().export_state();
        snap.csrs.retain(|(id, _)| *id != CsrId::Era.raw());
        let mut cpu = make_test_cpu();
        assert!(cpu.import_state(&snap).is_err());
        // Nothing was applied
        assert_eq!(cpu.gpr[4], 0);
    }
}
