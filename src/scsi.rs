//! SCSI command execution against a [`Backend`].
//!
//! Takes a CDB (and, for writes, however much payload has arrived so far)
//! and returns `Ok(None)` when more data is needed (the caller is
//! responsible for soliciting it via R2T) or `Ok(Some(response))` once the
//! command has run to completion.

use crate::backend::{Backend, CmpwriteResult, WriteVerifyResult};
use crate::error::ScsiResult;
use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x02,
    Read6 = 0x08,
    Write6 = 0x0A,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    StartStopUnit = 0x1B,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    WriteAndVerify10 = 0x2E,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    ModeSense10 = 0x5A,
    Read16 = 0x88,
    Write16 = 0x8A,
    Verify16 = 0x8F,
    SynchronizeCache16 = 0x91,
    ServiceActionIn16 = 0x9E, // READ CAPACITY(16) and GET LBA STATUS both hang off this opcode
    ReportLuns = 0xA0,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ScsiOpcode::TestUnitReady),
            0x02 => Some(ScsiOpcode::RequestSense),
            0x08 => Some(ScsiOpcode::Read6),
            0x0A => Some(ScsiOpcode::Write6),
            0x12 => Some(ScsiOpcode::Inquiry),
            0x1A => Some(ScsiOpcode::ModeSense6),
            0x1B => Some(ScsiOpcode::StartStopUnit),
            0x25 => Some(ScsiOpcode::ReadCapacity10),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x2E => Some(ScsiOpcode::WriteAndVerify10),
            0x2F => Some(ScsiOpcode::Verify10),
            0x35 => Some(ScsiOpcode::SynchronizeCache10),
            0x5A => Some(ScsiOpcode::ModeSense10),
            0x88 => Some(ScsiOpcode::Read16),
            0x8A => Some(ScsiOpcode::Write16),
            0x8F => Some(ScsiOpcode::Verify16),
            0x91 => Some(ScsiOpcode::SynchronizeCache16),
            0x9E => Some(ScsiOpcode::ServiceActionIn16),
            0xA0 => Some(ScsiOpcode::ReportLuns),
            _ => None,
        }
    }
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const VOLUME_OVERFLOW: u8 = 0x0D;
    pub const MISCOMPARE: u8 = 0x0E;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const MISCOMPARE_DURING_VERIFY: u8 = 0x1D;
}

/// Vendor/product identity reported by INQUIRY. Vendor matches the string
/// the original backend advertises.
pub const VENDOR_ID: &str = "vanHeusden";
pub const PRODUCT_ID: &str = "iscsi-target    ";
pub const PRODUCT_REV: &str = "1.0 ";
pub const DEFAULT_SERIAL: &str = "0000000000000001";

/// SCSI sense data (fixed format, 0x70)
#[derive(Debug, Clone)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serialize to fixed format sense data (18 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);
        data[7] = 10;
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }

    pub fn no_sense() -> Self {
        SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE, 0)
    }

    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    pub fn invalid_field() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    }

    pub fn lba_out_of_range(lba: u32) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0).with_info(lba)
    }

    pub fn medium_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, 0x11, 0x00)
    }

    pub fn lun_not_supported() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0)
    }

    pub fn miscompare(offset: u64) -> Self {
        SenseData::new(sense_key::MISCOMPARE, asc::MISCOMPARE_DURING_VERIFY, 0)
            .with_info(offset as u32)
    }
}

/// Result of SCSI command execution.
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    pub status: u8,
    pub data: Vec<u8>,
    pub sense: Option<SenseData>,
}

impl ScsiResponse {
    pub fn good(data: Vec<u8>) -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data,
            sense: None,
        }
    }

    pub fn good_no_data() -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data: Vec::new(),
            sense: None,
        }
    }

    pub fn check_condition(sense: SenseData) -> Self {
        ScsiResponse {
            status: scsi_status::CHECK_CONDITION,
            data: Vec::new(),
            sense: Some(sense),
        }
    }

    /// Sense buffer with the spec's mandatory 2-byte big-endian length
    /// prefix, ready to embed in a SCSI-Response PDU's data segment.
    pub fn sense_with_length_prefix(&self) -> Option<Vec<u8>> {
        self.sense.as_ref().map(|s| {
            let bytes = s.to_bytes();
            let mut out = Vec::with_capacity(2 + bytes.len());
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(&bytes);
            out
        })
    }
}

/// SCSI command executor, bound to one backend.
pub struct ScsiExecutor;

impl ScsiExecutor {
    /// Execute `cdb` against `backend`. `write_data` is whatever payload has
    /// arrived for the command so far; `Ok(None)` means the command needs
    /// more of it (the caller drives an R2T/Data-Out exchange and calls
    /// back in with the fuller buffer).
    pub fn execute(
        cdb: &[u8],
        backend: &dyn Backend,
        write_data: Option<&[u8]>,
    ) -> ScsiResult<Option<ScsiResponse>> {
        if cdb.is_empty() {
            return Ok(Some(ScsiResponse::check_condition(SenseData::invalid_command())));
        }

        let opcode = cdb[0];
        let resp = match ScsiOpcode::from_u8(opcode) {
            Some(ScsiOpcode::TestUnitReady) => Self::test_unit_ready(),
            Some(ScsiOpcode::RequestSense) => Self::request_sense(cdb),
            Some(ScsiOpcode::Inquiry) => Self::inquiry(cdb, backend),
            Some(ScsiOpcode::ReadCapacity10) => Self::read_capacity_10(backend),
            Some(ScsiOpcode::ServiceActionIn16) => Self::service_action_in_16(cdb, backend),
            Some(ScsiOpcode::Read6) => Self::read6(cdb, backend),
            Some(ScsiOpcode::Read10) => Self::read10(cdb, backend),
            Some(ScsiOpcode::Read16) => Self::read16(cdb, backend),
            Some(ScsiOpcode::Write6) => match Self::write6(cdb, backend, write_data) {
                Some(r) => r,
                None => return Ok(None),
            },
            Some(ScsiOpcode::Write10) => match Self::write10(cdb, backend, write_data) {
                Some(r) => r,
                None => return Ok(None),
            },
            Some(ScsiOpcode::Write16) => match Self::write16(cdb, backend, write_data) {
                Some(r) => r,
                None => return Ok(None),
            },
            Some(ScsiOpcode::WriteAndVerify10) => match Self::write_and_verify_10(cdb, backend, write_data) {
                Some(r) => r,
                None => return Ok(None),
            },
            Some(ScsiOpcode::ModeSense6) => Self::mode_sense_6(cdb),
            Some(ScsiOpcode::ModeSense10) => Self::mode_sense_10(cdb),
            Some(ScsiOpcode::SynchronizeCache10) | Some(ScsiOpcode::SynchronizeCache16) => {
                Self::synchronize_cache(backend)
            }
            Some(ScsiOpcode::ReportLuns) => Self::report_luns(cdb),
            Some(ScsiOpcode::StartStopUnit) => Self::start_stop_unit(cdb),
            Some(ScsiOpcode::Verify10) | Some(ScsiOpcode::Verify16) => ScsiResponse::good_no_data(),
            None => ScsiResponse::check_condition(SenseData::invalid_command()),
        };
        Ok(Some(resp))
    }

    fn test_unit_ready() -> ScsiResponse {
        ScsiResponse::good_no_data()
    }

    fn request_sense(cdb: &[u8]) -> ScsiResponse {
        if cdb.len() < 6 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        let alloc_len = cdb[4] as usize;
        let mut data = SenseData::no_sense().to_bytes();
        data.truncate(alloc_len.min(data.len()));
        ScsiResponse::good(data)
    }

    fn inquiry(cdb: &[u8], backend: &dyn Backend) -> ScsiResponse {
        if cdb.len() < 6 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        let evpd = cdb[1] & 0x01;
        let page_code = cdb[2];
        let alloc_len = BigEndian::read_u16(&cdb[3..5]) as usize;

        if evpd != 0 {
            return Self::inquiry_vpd(page_code, alloc_len);
        }

        let mut data = vec![0u8; 96];
        data[0] = 0x00; // direct access block device
        data[1] = 0x00; // not removable
        data[2] = 0x06; // SPC-4
        data[3] = 0x12; // response format 2, HiSup=1
        data[4] = 91;
        data[7] = 0x02; // CmdQue

        write_padded(&mut data[8..16], VENDOR_ID.as_bytes());
        write_padded(&mut data[16..32], PRODUCT_ID.as_bytes());
        write_padded(&mut data[32..36], PRODUCT_REV.as_bytes());
        let _ = backend.size_in_blocks(); // presence confirms a live backend

        data.truncate(alloc_len.min(data.len()));
        ScsiResponse::good(data)
    }

    fn inquiry_vpd(page_code: u8, alloc_len: usize) -> ScsiResponse {
        let mut data = match page_code {
            0x00 => {
                let mut d = vec![0x00, 0x00, 0x00, 4];
                d.extend_from_slice(&[0x00, 0x80, 0x83, 0xB0]);
                d
            }
            0x80 => {
                let mut d = vec![0x00, 0x80, 0x00, DEFAULT_SERIAL.len() as u8];
                d.extend_from_slice(DEFAULT_SERIAL.as_bytes());
                d
            }
            0x83 => {
                let mut d = vec![0x00, 0x83, 0x00, 0x00];
                d.extend_from_slice(&[
                    0x01, 0x03, 0x00, 0x08,
                    0x60, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
                ]);
                let len = d.len() - 4;
                d[3] = len as u8;
                d
            }
            0xB0 => {
                let mut d = vec![0u8; 64];
                d[0] = 0x00;
                d[1] = 0xB0;
                BigEndian::write_u16(&mut d[2..4], 60);
                BigEndian::write_u32(&mut d[8..12], 65535);
                BigEndian::write_u32(&mut d[12..16], 128);
                d
            }
            _ => return ScsiResponse::check_condition(SenseData::invalid_field()),
        };
        data.truncate(alloc_len.min(data.len()));
        ScsiResponse::good(data)
    }

    fn read_capacity_10(backend: &dyn Backend) -> ScsiResponse {
        let size = backend.size_in_blocks();
        let block_size = backend.block_size() as u32;
        let mut data = vec![0u8; 8];
        let last_lba = if size > 0 { size - 1 } else { 0 };
        let last_lba_32 = if last_lba > 0xFFFF_FFFE {
            0xFFFF_FFFF_u32
        } else {
            last_lba as u32
        };
        BigEndian::write_u32(&mut data[0..4], last_lba_32);
        BigEndian::write_u32(&mut data[4..8], block_size);
        ScsiResponse::good(data)
    }

    fn service_action_in_16(cdb: &[u8], backend: &dyn Backend) -> ScsiResponse {
        if cdb.len() < 16 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        match cdb[1] & 0x1F {
            0x10 => Self::read_capacity_16(cdb, backend),
            0x12 => Self::get_lba_status(cdb, backend),
            _ => ScsiResponse::check_condition(SenseData::invalid_command()),
        }
    }

    fn read_capacity_16(cdb: &[u8], backend: &dyn Backend) -> ScsiResponse {
        let alloc_len = BigEndian::read_u32(&cdb[10..14]) as usize;
        let size = backend.size_in_blocks();
        let block_size = backend.block_size() as u32;
        let mut data = vec![0u8; 32];
        let last_lba = if size > 0 { size - 1 } else { 0 };
        BigEndian::write_u64(&mut data[0..8], last_lba);
        BigEndian::write_u32(&mut data[8..12], block_size);
        data.truncate(alloc_len.min(data.len()));
        ScsiResponse::good(data)
    }

    /// GET LBA STATUS (0x9E / service action 0x12). Derived from the same
    /// zero-block heuristic as free-space estimation: read the requested
    /// block and report it mapped or deallocated by whether it's all zero.
    fn get_lba_status(cdb: &[u8], backend: &dyn Backend) -> ScsiResponse {
        let starting_lba = BigEndian::read_u64(&cdb[2..10]);
        let alloc_len = BigEndian::read_u32(&cdb[10..14]) as usize;
        let size = backend.size_in_blocks();

        if starting_lba >= size {
            return ScsiResponse::check_condition(SenseData::lba_out_of_range(
                (starting_lba & 0xFFFF_FFFF) as u32,
            ));
        }

        let block_size = backend.block_size() as usize;
        let mut buf = vec![0u8; block_size];
        let mapped = backend.read(starting_lba, 1, &mut buf) && !buf.iter().all(|&b| b == 0);

        let mut data = vec![0u8; 32];
        BigEndian::write_u32(&mut data[0..4], 20); // parameter data length
        BigEndian::write_u64(&mut data[8..16], starting_lba);
        BigEndian::write_u32(&mut data[16..20], (size - starting_lba).min(u32::MAX as u64) as u32);
        data[20] = if mapped { 0x00 } else { 0x01 };

        data.truncate(alloc_len.min(data.len()));
        ScsiResponse::good(data)
    }

    fn read6(cdb: &[u8], backend: &dyn Backend) -> ScsiResponse {
        if cdb.len() < 6 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        let (lba, length) = parse_rw6(cdb);
        Self::do_read(backend, lba, length)
    }

    fn read10(cdb: &[u8], backend: &dyn Backend) -> ScsiResponse {
        if cdb.len() < 10 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
        let length = BigEndian::read_u16(&cdb[7..9]) as u32;
        Self::do_read(backend, lba, length)
    }

    fn read16(cdb: &[u8], backend: &dyn Backend) -> ScsiResponse {
        if cdb.len() < 16 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        let lba = BigEndian::read_u64(&cdb[2..10]);
        let length = BigEndian::read_u32(&cdb[10..14]);
        Self::do_read(backend, lba, length)
    }

    fn do_read(backend: &dyn Backend, lba: u64, n_blocks: u32) -> ScsiResponse {
        if n_blocks == 0 {
            return ScsiResponse::good_no_data();
        }
        if lba + n_blocks as u64 > backend.size_in_blocks() {
            return ScsiResponse::check_condition(SenseData::lba_out_of_range(
                (lba & 0xFFFF_FFFF) as u32,
            ));
        }
        let mut buf = vec![0u8; (n_blocks as u64 * backend.block_size()) as usize];
        if backend.read(lba, n_blocks, &mut buf) {
            ScsiResponse::good(buf)
        } else {
            ScsiResponse::check_condition(SenseData::medium_error())
        }
    }

    fn write6(cdb: &[u8], backend: &dyn Backend, write_data: Option<&[u8]>) -> Option<ScsiResponse> {
        if cdb.len() < 6 {
            return Some(ScsiResponse::check_condition(SenseData::invalid_field()));
        }
        let (lba, length) = parse_rw6(cdb);
        Some(Self::do_write(backend, lba, length, write_data)?)
    }

    fn write10(cdb: &[u8], backend: &dyn Backend, write_data: Option<&[u8]>) -> Option<ScsiResponse> {
        if cdb.len() < 10 {
            return Some(ScsiResponse::check_condition(SenseData::invalid_field()));
        }
        let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
        let length = BigEndian::read_u16(&cdb[7..9]) as u32;
        Some(Self::do_write(backend, lba, length, write_data)?)
    }

    fn write16(cdb: &[u8], backend: &dyn Backend, write_data: Option<&[u8]>) -> Option<ScsiResponse> {
        if cdb.len() < 16 {
            return Some(ScsiResponse::check_condition(SenseData::invalid_field()));
        }
        let lba = BigEndian::read_u64(&cdb[2..10]);
        let length = BigEndian::read_u32(&cdb[10..14]);
        Some(Self::do_write(backend, lba, length, write_data)?)
    }

    fn do_write(
        backend: &dyn Backend,
        lba: u64,
        n_blocks: u32,
        write_data: Option<&[u8]>,
    ) -> Option<ScsiResponse> {
        if n_blocks == 0 {
            return Some(ScsiResponse::good_no_data());
        }
        if lba + n_blocks as u64 > backend.size_in_blocks() {
            return Some(ScsiResponse::check_condition(SenseData::lba_out_of_range(
                (lba & 0xFFFF_FFFF) as u32,
            )));
        }
        let expected_len = n_blocks as u64 * backend.block_size();
        let data = write_data?;
        if (data.len() as u64) < expected_len {
            return None;
        }
        if backend.write(lba, n_blocks, &data[..expected_len as usize]) {
            Some(ScsiResponse::good_no_data())
        } else {
            Some(ScsiResponse::check_condition(SenseData::medium_error()))
        }
    }

    /// WRITE AND VERIFY(10): write, then read the range back and compare.
    /// Implemented as a single range-locked [`Backend::write_and_verify`],
    /// so the comparison can't race another writer between the write and
    /// the read-back.
    fn write_and_verify_10(
        cdb: &[u8],
        backend: &dyn Backend,
        write_data: Option<&[u8]>,
    ) -> Option<ScsiResponse> {
        if cdb.len() < 10 {
            return Some(ScsiResponse::check_condition(SenseData::invalid_field()));
        }
        let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
        let n_blocks = BigEndian::read_u16(&cdb[7..9]) as u32;
        if n_blocks == 0 {
            return Some(ScsiResponse::good_no_data());
        }
        if lba + n_blocks as u64 > backend.size_in_blocks() {
            return Some(ScsiResponse::check_condition(SenseData::lba_out_of_range(
                (lba & 0xFFFF_FFFF) as u32,
            )));
        }
        let expected_len = (n_blocks as u64 * backend.block_size()) as usize;
        let data = write_data?;
        if data.len() < expected_len {
            return None;
        }
        let payload = &data[..expected_len];
        match backend.write_and_verify(lba, n_blocks, payload) {
            WriteVerifyResult::Ok => Some(ScsiResponse::good_no_data()),
            WriteVerifyResult::Mismatch { offset } => {
                Some(ScsiResponse::check_condition(SenseData::miscompare(offset)))
            }
            WriteVerifyResult::WriteError | WriteVerifyResult::ReadError => {
                Some(ScsiResponse::check_condition(SenseData::medium_error()))
            }
        }
    }

    fn mode_sense_6(cdb: &[u8]) -> ScsiResponse {
        if cdb.len() < 6 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        let alloc_len = cdb[4] as usize;
        let mut data = vec![0u8; 4];
        data[0] = 3;
        data.truncate(alloc_len.min(data.len()));
        ScsiResponse::good(data)
    }

    fn mode_sense_10(cdb: &[u8]) -> ScsiResponse {
        if cdb.len() < 10 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        let alloc_len = BigEndian::read_u16(&cdb[7..9]) as usize;
        let mut data = vec![0u8; 8];
        BigEndian::write_u16(&mut data[0..2], 6);
        data.truncate(alloc_len.min(data.len()));
        ScsiResponse::good(data)
    }

    fn synchronize_cache(backend: &dyn Backend) -> ScsiResponse {
        if backend.sync() {
            ScsiResponse::good_no_data()
        } else {
            ScsiResponse::check_condition(SenseData::medium_error())
        }
    }

    fn report_luns(cdb: &[u8]) -> ScsiResponse {
        if cdb.len() < 12 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        let alloc_len = BigEndian::read_u32(&cdb[6..10]) as usize;
        let mut data = vec![0u8; 16];
        BigEndian::write_u32(&mut data[0..4], 8);
        data.truncate(alloc_len.min(data.len()));
        ScsiResponse::good(data)
    }

    fn start_stop_unit(_cdb: &[u8]) -> ScsiResponse {
        ScsiResponse::good_no_data()
    }
}

fn write_padded(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    for b in &mut dst[n..] {
        *b = b' ';
    }
}

/// 21-bit LBA / 8-bit length (0 means 256) used by READ(6)/WRITE(6).
fn parse_rw6(cdb: &[u8]) -> (u64, u32) {
    let lba = (((cdb[1] & 0x1F) as u64) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64;
    let length = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
    (lba, length)
}
