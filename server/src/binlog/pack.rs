// SPDX-License-Identifier: MPL-2.0

//! The textual binlog record codec.
//!
//! Each record is self-delimiting and escape-encoded:
//!
//! ```text
//! 0000000066<rec dv=7 id=42 op=3,cre ts=1000 ns=2,ns pt=2,/x hc=9 /rec>\n
//! ```
//!
//! The fixed-width decimal prefix counts every byte from the `<` to the
//! terminating newline, which is what makes random seeks and the four scan
//! directions (`detect`, `detect_forward`, `detect_reverse`,
//! `detect_last_record_end`) possible.

use super::record::{BinlogRecord, RecordOp, RecordOptions};
use crate::prelude::*;
use crate::types::FullName;

pub const RECORD_START_TAG: &[u8] = b"<rec";
pub const RECORD_END_TAG: &[u8] = b"/rec>\n";
/// Width of the zero-padded decimal size prefix.
pub const RECORD_SIZE_LEN: usize = 10;
pub const RECORD_MAX_SIZE: usize = 64 * 1024;
/// `size prefix + "<rec" + " dv=1 id=1 op=3,cre ts=1 hc=0" + " /rec>\n"`.
pub const RECORD_MIN_SIZE: usize = RECORD_SIZE_LEN + 40;

const END_TAG_LEN: usize = RECORD_END_TAG.len();

fn escape_into(src: &[u8], out: &mut Vec<u8>) {
    for &b in src {
        match b {
            0 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            0x0b => out.extend_from_slice(b"\\v"),
            0x0c => out.extend_from_slice(b"\\f"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'<' => out.extend_from_slice(b"\\l"),
            b'>' => out.extend_from_slice(b"\\g"),
            _ => out.push(b),
        }
    }
}

fn unescape(src: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    let mut iter = src.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let Some(&code) = iter.next() else {
            return_errno_with_message!(Errno::EINVAL, "dangling escape at end of value");
        };
        out.push(match code {
            b'0' => 0,
            b'n' => b'\n',
            b'v' => 0x0b,
            b'f' => 0x0c,
            b'r' => b'\r',
            b'\\' => b'\\',
            b'l' => b'<',
            b'g' => b'>',
            _ => return_errno_with_message!(Errno::EINVAL, "unknown escape code"),
        });
    }
    Ok(out)
}

fn push_int_field(buf: &mut Vec<u8>, name: &str, value: i64) {
    buf.extend_from_slice(format!(" {}={}", name, value).as_bytes());
}

fn push_string_field(buf: &mut Vec<u8>, name: &str, value: &[u8], need_escape: bool) {
    let mut escaped;
    let bytes = if need_escape {
        escaped = Vec::with_capacity(value.len());
        escape_into(value, &mut escaped);
        escaped.as_slice()
    } else {
        value
    };
    buf.extend_from_slice(format!(" {}={},", name, bytes.len()).as_bytes());
    buf.extend_from_slice(bytes);
}

/// Appends the packed form of `record` to `buffer`.
///
/// On `EOVERFLOW` (the encoded record would exceed [`RECORD_MAX_SIZE`])
/// the buffer is restored to its original length.
pub fn pack_record(record: &BinlogRecord, buffer: &mut Vec<u8>) -> Result<()> {
    let old_len = buffer.len();
    buffer.resize(old_len + RECORD_SIZE_LEN, b'0');
    buffer.extend_from_slice(RECORD_START_TAG);

    push_int_field(buffer, "dv", record.data_version as i64);
    push_int_field(buffer, "id", record.inode as i64);
    push_string_field(buffer, "op", record.operation.label().as_bytes(), false);
    push_int_field(buffer, "ts", record.timestamp);

    if record.options.intersects(RecordOptions::PATH_ENABLED) {
        push_string_field(buffer, "ns", &record.fullname.ns, true);
        push_string_field(buffer, "pt", &record.fullname.path, true);
    }

    push_int_field(buffer, "hc", record.hash_code as i64);

    if record.options.contains(RecordOptions::EXTRA_DATA) {
        push_string_field(buffer, "ex", &record.extra_data, true);
    }
    if record.options.contains(RecordOptions::USER_DATA) {
        push_string_field(buffer, "us", &record.user_data, true);
    }
    if record.options.contains(RecordOptions::MODE) {
        push_int_field(buffer, "md", record.stat.mode as i64);
    }
    if record.options.contains(RecordOptions::ATIME) {
        push_int_field(buffer, "at", record.stat.atime);
    }
    if record.options.contains(RecordOptions::CTIME) {
        push_int_field(buffer, "ct", record.stat.ctime);
    }
    if record.options.contains(RecordOptions::MTIME) {
        push_int_field(buffer, "mt", record.stat.mtime);
    }
    if record.options.contains(RecordOptions::UID) {
        push_int_field(buffer, "ui", record.stat.uid as i64);
    }
    if record.options.contains(RecordOptions::GID) {
        push_int_field(buffer, "gi", record.stat.gid as i64);
    }
    if record.options.contains(RecordOptions::SIZE) {
        push_int_field(buffer, "sz", record.stat.size);
    }

    buffer.push(b' ');
    buffer.extend_from_slice(RECORD_END_TAG);

    let record_len = buffer.len() - old_len - RECORD_SIZE_LEN;
    if record_len > RECORD_MAX_SIZE {
        error!("record length {} exceeds {}", record_len, RECORD_MAX_SIZE);
        buffer.truncate(old_len);
        return_errno!(Errno::EOVERFLOW);
    }
    let prefix = format!("{:0width$}", record_len, width = RECORD_SIZE_LEN);
    buffer[old_len..old_len + RECORD_SIZE_LEN].copy_from_slice(prefix.as_bytes());
    Ok(())
}

enum FieldValue {
    Int(i64),
    Str(Vec<u8>),
}

struct FieldParser<'a> {
    buf: &'a [u8],
    pos: usize,
    rec_end: usize,
}

impl<'a> FieldParser<'a> {
    /// Parses ` key=value`; returns `None` once the end tag is reached.
    fn next_field(&mut self) -> Result<Option<([u8; 2], FieldValue)>> {
        if self.pos >= self.rec_end || self.buf[self.pos] != b' ' {
            return_errno_with_message!(Errno::EINVAL, "expect space before field or end tag");
        }
        self.pos += 1;

        if self.buf[self.pos] == b'/' {
            if self.rec_end - self.pos == END_TAG_LEN
                && &self.buf[self.pos..self.rec_end] == RECORD_END_TAG
            {
                self.pos = self.rec_end;
                return Ok(None);
            }
            return_errno_with_message!(Errno::EINVAL, "stray / before record end");
        }

        if self.rec_end - self.pos < 4 + END_TAG_LEN {
            return_errno_with_message!(Errno::EINVAL, "record remainder too short for a field");
        }
        let name: [u8; 2] = [self.buf[self.pos], self.buf[self.pos + 1]];
        if self.buf[self.pos + 2] != b'=' {
            return_errno_with_message!(Errno::EINVAL, "expect = after field name");
        }
        self.pos += 3;

        let (number, digits_end) = self.parse_int()?;
        match self.buf.get(digits_end) {
            Some(b',') => {
                // A string value: `number` was its byte count.
                if number < 0 {
                    return_errno_with_message!(Errno::EINVAL, "negative string length");
                }
                let start = digits_end + 1;
                let end = start + number as usize;
                if end + 1 + END_TAG_LEN > self.rec_end {
                    return_errno_with_message!(Errno::EINVAL, "string value out of bound");
                }
                self.pos = end;
                Ok(Some((name, FieldValue::Str(unescape(&self.buf[start..end])?))))
            }
            Some(b' ') => {
                self.pos = digits_end;
                Ok(Some((name, FieldValue::Int(number))))
            }
            _ => return_errno_with_message!(Errno::EINVAL, "expect comma or space after value"),
        }
    }

    /// Parses a decimal token at `pos`; returns the value and the offset
    /// one past its last digit.
    fn parse_int(&self) -> Result<(i64, usize)> {
        let mut index = self.pos;
        let negative = if self.buf.get(index) == Some(&b'-') {
            index += 1;
            true
        } else {
            false
        };
        let digits_start = index;
        let mut value: i64 = 0;
        while index < self.rec_end && self.buf[index].is_ascii_digit() {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((self.buf[index] - b'0') as i64))
                .ok_or(Error::with_message(Errno::EINVAL, "integer value overflows"))?;
            index += 1;
        }
        if index == digits_start {
            return_errno_with_message!(Errno::EINVAL, "expect integer value");
        }
        Ok((if negative { -value } else { value }, index))
    }
}

/// Validates the framing of the record at `buf[0..]` and returns the
/// offset one past its terminating newline.
fn check_record(buf: &[u8]) -> Result<usize> {
    if buf.len() < RECORD_MIN_SIZE {
        return_errno_with_message!(Errno::EAGAIN, "record buffer too short");
    }
    let prefix = &buf[..RECORD_SIZE_LEN];
    if !prefix.iter().all(|b| b.is_ascii_digit()) {
        return_errno_with_message!(Errno::EINVAL, "record size prefix is not decimal");
    }
    // The prefix is all digits and bounded, so this cannot fail.
    let record_len: usize = std::str::from_utf8(prefix).unwrap().parse()?;
    if !buf[RECORD_SIZE_LEN..].starts_with(RECORD_START_TAG) {
        return_errno_with_message!(Errno::EINVAL, "expect record start tag");
    }
    if record_len < RECORD_MIN_SIZE - RECORD_SIZE_LEN {
        return_errno_with_message!(Errno::EINVAL, "record length too short");
    }
    if record_len > buf.len() - RECORD_SIZE_LEN {
        return_errno_with_message!(Errno::EOVERFLOW, "record length out of bound");
    }
    let rec_end = RECORD_SIZE_LEN + record_len;
    if &buf[rec_end - END_TAG_LEN..rec_end] != RECORD_END_TAG {
        return_errno_with_message!(Errno::EINVAL, "expect record end tag");
    }
    Ok(rec_end)
}

fn parse_first_field(parser: &mut FieldParser) -> Result<u64> {
    match parser.next_field()? {
        Some((name, FieldValue::Int(dv))) if &name == b"dv" => Ok(dv as u64),
        _ => return_errno_with_message!(Errno::EINVAL, "first field must be data version (dv)"),
    }
}

fn set_field(record: &mut BinlogRecord, name: [u8; 2], value: FieldValue) -> Result<()> {
    fn int(value: FieldValue) -> Result<i64> {
        match value {
            FieldValue::Int(n) => Ok(n),
            FieldValue::Str(_) => {
                return_errno_with_message!(Errno::EINVAL, "field value type: string != expected: integer")
            }
        }
    }
    fn string(value: FieldValue) -> Result<Vec<u8>> {
        match value {
            FieldValue::Str(s) => Ok(s),
            FieldValue::Int(_) => {
                return_errno_with_message!(Errno::EINVAL, "field value type: integer != expected: string")
            }
        }
    }

    match &name {
        b"dv" => record.data_version = int(value)? as u64,
        b"id" => record.inode = int(value)? as u64,
        b"op" => record.operation = RecordOp::from_label(&string(value)?),
        b"ts" => record.timestamp = int(value)?,
        b"ns" => {
            record.fullname.ns = string(value)?;
            record.options |= RecordOptions::NS;
        }
        b"pt" => {
            record.fullname.path = string(value)?;
            record.options |= RecordOptions::PATH;
        }
        b"ex" => {
            record.extra_data = string(value)?;
            record.options |= RecordOptions::EXTRA_DATA;
        }
        b"us" => {
            record.user_data = string(value)?;
            record.options |= RecordOptions::USER_DATA;
        }
        b"md" => {
            record.stat.mode = int(value)? as u32;
            record.options |= RecordOptions::MODE;
        }
        b"at" => {
            record.stat.atime = int(value)?;
            record.options |= RecordOptions::ATIME;
        }
        b"ct" => {
            record.stat.ctime = int(value)?;
            record.options |= RecordOptions::CTIME;
        }
        b"mt" => {
            record.stat.mtime = int(value)?;
            record.options |= RecordOptions::MTIME;
        }
        b"ui" => {
            record.stat.uid = int(value)? as u32;
            record.options |= RecordOptions::UID;
        }
        b"gi" => {
            record.stat.gid = int(value)? as u32;
            record.options |= RecordOptions::GID;
        }
        b"sz" => {
            record.stat.size = int(value)?;
            record.options |= RecordOptions::SIZE;
        }
        b"hc" => {
            record.hash_code = int(value)? as u32;
            record.options |= RecordOptions::HASH_CODE;
        }
        _ => {
            // Unknown fields warn but do not fail, so newer masters can
            // extend the vocabulary.
            warn!(
                "unknown binlog field name: {}",
                String::from_utf8_lossy(&name)
            );
        }
    }
    Ok(())
}

fn check_required_fields(record: &BinlogRecord) -> Result<()> {
    if record.inode == 0 {
        return_errno_with_message!(Errno::ENOENT, "expect inode field: id");
    }
    if record.data_version == 0 {
        return_errno_with_message!(Errno::ENOENT, "expect data version field: dv");
    }
    if !record.options.contains(RecordOptions::HASH_CODE) {
        return_errno_with_message!(Errno::ENOENT, "expect hash code field: hc");
    }
    if record.operation == RecordOp::None {
        return_errno_with_message!(Errno::ENOENT, "expect operation field: op");
    }
    if record.timestamp <= 0 {
        return_errno_with_message!(Errno::ENOENT, "expect timestamp field: ts");
    }
    if record.options.intersects(RecordOptions::PATH_ENABLED) {
        if !record.options.contains(RecordOptions::NS) {
            return_errno_with_message!(Errno::ENOENT, "expect namespace field: ns");
        }
        if !record.options.contains(RecordOptions::PATH) {
            return_errno_with_message!(Errno::ENOENT, "expect path field: pt");
        }
    }
    Ok(())
}

/// Fully decodes the record at the front of `buf`.
///
/// Returns the record and the offset one past its terminating newline.
pub fn unpack_record(buf: &[u8]) -> Result<(BinlogRecord, usize)> {
    let rec_end = check_record(buf)?;
    let mut parser = FieldParser {
        buf,
        pos: RECORD_SIZE_LEN + RECORD_START_TAG.len(),
        rec_end,
    };

    let mut record = BinlogRecord {
        fullname: FullName::default(),
        ..Default::default()
    };
    record.data_version = parse_first_field(&mut parser)?;
    while let Some((name, value)) = parser.next_field()? {
        set_field(&mut record, name, value)?;
    }
    check_required_fields(&record)?;
    // The options mask reflects only what the caller must preserve.
    record.options -= RecordOptions::HASH_CODE;
    Ok((record, rec_end))
}

/// Decodes only the leading `dv` field of the record at the front of `buf`.
pub fn detect_record(buf: &[u8]) -> Result<(u64, usize)> {
    let rec_end = check_record(buf)?;
    let mut parser = FieldParser {
        buf,
        pos: RECORD_SIZE_LEN + RECORD_START_TAG.len(),
        rec_end,
    };
    Ok((parse_first_field(&mut parser)?, rec_end))
}

/// True if a complete, well-framed record starts at `buf[0]`.
fn is_record_start(buf: &[u8]) -> bool {
    if buf.len() < RECORD_MIN_SIZE {
        return false;
    }
    let prefix = &buf[..RECORD_SIZE_LEN];
    if !prefix.iter().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let record_len: usize = match std::str::from_utf8(prefix).unwrap().parse() {
        Ok(n) => n,
        Err(_) => return false,
    };
    if !buf[RECORD_SIZE_LEN..].starts_with(RECORD_START_TAG) {
        return false;
    }
    if record_len < RECORD_MIN_SIZE - RECORD_SIZE_LEN
        || record_len > buf.len() - RECORD_SIZE_LEN
    {
        return false;
    }
    let rec_end = RECORD_SIZE_LEN + record_len;
    &buf[rec_end - END_TAG_LEN..rec_end] == RECORD_END_TAG
}

/// Scans forward for the first valid record start; used to re-sync a
/// reader positioned inside a torn record.
///
/// Returns `(data_version, start_offset, end_offset)`.
pub fn detect_record_forward(buf: &[u8]) -> Result<(u64, usize, usize)> {
    let mut search_from = 0;
    while search_from + RECORD_MIN_SIZE <= buf.len() {
        let Some(lt) = buf[search_from..].iter().position(|&b| b == b'<') else {
            break;
        };
        let lt = search_from + lt;
        if lt >= RECORD_SIZE_LEN {
            let start = lt - RECORD_SIZE_LEN;
            if is_record_start(&buf[start..]) {
                let (dv, rec_end) = detect_record(&buf[start..])?;
                return Ok((dv, start, start + rec_end));
            }
        }
        search_from = lt + 1;
    }
    return_errno_with_message!(Errno::ENOENT, "can't find record start");
}

/// Scans backward for the last valid record start; used to find the
/// latest durable record on startup.
///
/// Returns `(data_version, end_offset)`.
pub fn detect_record_reverse(buf: &[u8]) -> Result<(u64, usize)> {
    if buf.len() < RECORD_MIN_SIZE {
        return_errno_with_message!(Errno::EAGAIN, "record buffer too short");
    }
    let mut search_end = buf.len();
    while search_end > 0 {
        let Some(lt) = buf[..search_end].iter().rposition(|&b| b == b'<') else {
            break;
        };
        if lt >= RECORD_SIZE_LEN {
            let start = lt - RECORD_SIZE_LEN;
            if is_record_start(&buf[start..]) {
                let (dv, rec_end) = detect_record(&buf[start..])?;
                return Ok((dv, start + rec_end));
            }
        }
        search_end = lt;
    }
    return_errno_with_message!(Errno::ENOENT, "can't find record start");
}

/// Locates the byte just past the last `/rec>\n`; the writer uses this to
/// position itself after a clean boundary (discarding any torn tail).
pub fn detect_last_record_end(buf: &[u8]) -> Result<usize> {
    let mut search_end = buf.len();
    while search_end > 0 {
        let Some(nl) = buf[..search_end].iter().rposition(|&b| b == b'\n') else {
            break;
        };
        let end = nl + 1;
        if end >= END_TAG_LEN && &buf[end - END_TAG_LEN..end] == RECORD_END_TAG {
            return Ok(end);
        }
        search_end = nl;
    }
    return_errno_with_message!(Errno::ENOENT, "can't find record end tag")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::DentryStat;

    fn sample_record() -> BinlogRecord {
        BinlogRecord {
            inode: 42,
            data_version: 7,
            operation: RecordOp::Create,
            timestamp: 1000,
            hash_code: 9,
            fullname: FullName::new(b"ns", b"/x"),
            stat: DentryStat {
                mode: 0o100644,
                size: 0,
                ..Default::default()
            },
            options: RecordOptions::PATH_ENABLED | RecordOptions::MODE | RecordOptions::SIZE,
            ..Default::default()
        }
    }

    #[test]
    fn packs_expected_text() {
        let mut buffer = Vec::new();
        pack_record(&sample_record(), &mut buffer).unwrap();

        let expected_body = b"<rec dv=7 id=42 op=3,cre ts=1000 ns=2,ns pt=2,/x hc=9 md=33188 sz=0 /rec>\n";
        assert_eq!(&buffer[RECORD_SIZE_LEN..], expected_body.as_slice());
        let prefix = std::str::from_utf8(&buffer[..RECORD_SIZE_LEN]).unwrap();
        assert_eq!(prefix.parse::<usize>().unwrap(), expected_body.len());
    }

    #[test]
    fn unpack_round_trip() {
        let record = sample_record();
        let mut buffer = Vec::new();
        pack_record(&record, &mut buffer).unwrap();

        let (unpacked, end) = unpack_record(&buffer).unwrap();
        assert_eq!(end, buffer.len());
        assert_eq!(unpacked.data_version, record.data_version);
        assert_eq!(unpacked.inode, record.inode);
        assert_eq!(unpacked.operation, RecordOp::Create);
        assert_eq!(unpacked.timestamp, record.timestamp);
        assert_eq!(unpacked.hash_code, record.hash_code);
        assert_eq!(unpacked.fullname.ns, record.fullname.ns);
        assert_eq!(unpacked.fullname.path, record.fullname.path);
        assert_eq!(unpacked.stat.mode, record.stat.mode);
        assert_eq!(unpacked.stat.size, record.stat.size);
        assert_eq!(unpacked.options, record.options);
    }

    #[test]
    fn escape_round_trip() {
        let mut record = sample_record();
        record.fullname.path = b"/\0\n\x0b\x0c\r\\<>end".to_vec();
        record.extra_data = b"<rec /rec>\n\\".to_vec();
        record.options |= RecordOptions::EXTRA_DATA;

        let mut buffer = Vec::new();
        pack_record(&record, &mut buffer).unwrap();
        // None of the specials may survive unescaped inside the value area.
        let (unpacked, _) = unpack_record(&buffer).unwrap();
        assert_eq!(unpacked.fullname.path, record.fullname.path);
        assert_eq!(unpacked.extra_data, record.extra_data);
    }

    #[test]
    fn all_optional_fields_round_trip() {
        let mut record = sample_record();
        record.user_data = b"user".to_vec();
        record.extra_data = b"extra".to_vec();
        record.stat = DentryStat {
            mode: 0o040755,
            uid: 100,
            gid: 200,
            atime: 11,
            ctime: 12,
            mtime: 13,
            size: 14,
        };
        record.options = RecordOptions::PATH_ENABLED
            | RecordOptions::USER_DATA
            | RecordOptions::EXTRA_DATA
            | RecordOptions::STAT_MASK;

        let mut buffer = Vec::new();
        pack_record(&record, &mut buffer).unwrap();
        let (unpacked, _) = unpack_record(&buffer).unwrap();
        assert_eq!(unpacked.stat, record.stat);
        assert_eq!(unpacked.user_data, record.user_data);
        assert_eq!(unpacked.extra_data, record.extra_data);
        assert_eq!(unpacked.options, record.options);
    }

    #[test]
    fn unknown_field_warns_but_parses() {
        let mut buffer = Vec::new();
        pack_record(&sample_record(), &mut buffer).unwrap();
        // Splice an unknown field in front of the end tag.
        let insert_at = buffer.len() - (1 + RECORD_END_TAG.len());
        let mut extended = buffer[..insert_at].to_vec();
        extended.extend_from_slice(b" zz=5 /rec>\n");
        let record_len = extended.len() - RECORD_SIZE_LEN;
        extended[..RECORD_SIZE_LEN]
            .copy_from_slice(format!("{:010}", record_len).as_bytes());

        let (unpacked, _) = unpack_record(&extended).unwrap();
        assert_eq!(unpacked.inode, 42);
    }

    #[test]
    fn type_mismatch_fails() {
        let mut buffer = Vec::new();
        pack_record(&sample_record(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let bad = text.replace(" md=33188", " md=5,33188");
        let record_len = bad.len() - RECORD_SIZE_LEN;
        let bad = format!("{:010}{}", record_len, &bad[RECORD_SIZE_LEN..]);
        assert_eq!(
            unpack_record(bad.as_bytes()).unwrap_err().error(),
            Errno::EINVAL
        );
    }

    #[test]
    fn missing_required_field_fails() {
        // A record with no inode field.
        let body = b"<rec dv=7 op=3,cre ts=1000 hc=9 /rec>\n";
        let text = format!("{:010}{}", body.len(), std::str::from_utf8(body).unwrap());
        assert_eq!(
            unpack_record(text.as_bytes()).unwrap_err().error(),
            Errno::ENOENT
        );
    }

    #[test]
    fn oversized_record_rejected() {
        let mut record = sample_record();
        record.extra_data = vec![b'x'; RECORD_MAX_SIZE];
        record.options |= RecordOptions::EXTRA_DATA;
        let mut buffer = Vec::new();
        assert_eq!(
            pack_record(&record, &mut buffer).unwrap_err().error(),
            Errno::EOVERFLOW
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn detect_only_reads_data_version() {
        let mut buffer = Vec::new();
        pack_record(&sample_record(), &mut buffer).unwrap();
        let (dv, end) = detect_record(&buffer).unwrap();
        assert_eq!(dv, 7);
        assert_eq!(end, buffer.len());
    }

    #[test]
    fn forward_and_reverse_detect_across_splits() {
        let mut buffer = Vec::new();
        let mut ends = Vec::new();
        for dv in 1..=4u64 {
            let mut record = sample_record();
            record.data_version = dv;
            record.inode = 100 + dv;
            pack_record(&record, &mut buffer).unwrap();
            ends.push(buffer.len());
        }

        // From any split point inside record k, forward detect finds
        // record k+1 (or fails after the last).
        for (k, window) in ends.windows(2).enumerate() {
            let (prev_end, next_end) = (window[0], window[1]);
            let record_start = if k == 0 { 0 } else { ends[k - 1] };
            for split in record_start + 1..prev_end {
                let (dv, start, end) = detect_record_forward(&buffer[split..]).unwrap();
                assert_eq!(dv, (k + 2) as u64, "split at {split}");
                assert_eq!(split + start, prev_end);
                assert_eq!(split + end, next_end);
            }
        }
        for split in ends[2] + 1..ends[3] {
            assert!(detect_record_forward(&buffer[split..]).is_err());
        }

        // Reverse detect over the full buffer yields the final record.
        let (dv, end) = detect_record_reverse(&buffer).unwrap();
        assert_eq!(dv, 4);
        assert_eq!(end, *ends.last().unwrap());
    }

    #[test]
    fn last_record_end_skips_torn_tail() {
        let mut buffer = Vec::new();
        pack_record(&sample_record(), &mut buffer).unwrap();
        let clean_end = buffer.len();
        buffer.extend_from_slice(b"0000000072<rec dv=8 id=43 op=3,cre ts=10");

        assert_eq!(detect_last_record_end(&buffer).unwrap(), clean_end);
        assert!(detect_last_record_end(b"no records here").is_err());
    }
}
