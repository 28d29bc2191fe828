use bitstream_io::{BitRead, BitReader, BitWrite, BitWriter, Endianness};

use super::{
    ParseError, labels_to_name, name_to_labels, read_name, write_labels,
    enums::{RecordClass, RecordType},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    pub labels: Vec<String>,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    pub fn name(&self) -> String {
        labels_to_name(&self.labels)
    }

    pub fn set_name(&mut self, name: &str) {
        self.labels = name_to_labels(name);
    }

    /// A record with a 4-byte address payload.
    pub fn a(name: &str, ttl: u32, addr: std::net::Ipv4Addr) -> Self {
        Record {
            labels: name_to_labels(name),
            rtype: RecordType::A,
            rclass: RecordClass::IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    /// CNAME record; the target is stored as uncompressed labels.
    pub fn cname(name: &str, target: &str, ttl: u32) -> Self {
        let mut rdata = Vec::new();
        for label in name_to_labels(target) {
            rdata.push(label.len() as u8);
            rdata.extend_from_slice(label.as_bytes());
        }
        rdata.push(0);
        Record {
            labels: name_to_labels(name),
            rtype: RecordType::CNAME,
            rclass: RecordClass::IN,
            ttl,
            rdata,
        }
    }

    pub(super) fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError> {
        write_labels(writer, &self.labels)?;
        writer.write_var::<u16>(16, self.rtype.into())?;
        writer.write_var::<u16>(16, self.rclass.into())?;
        writer.write_var::<u32>(32, self.ttl)?;
        writer.write_var::<u16>(16, self.rdata.len() as u16)?;
        writer.write_bytes(&self.rdata)?;
        Ok(())
    }

    pub(super) fn read<E: Endianness>(
        reader: &mut BitReader<&[u8], E>,
        packet: &[u8],
    ) -> Result<Self, ParseError> {
        let labels = read_name(reader, packet)?;
        let rtype = reader.read_var::<u16>(16)?.into();
        let rclass = reader.read_var::<u16>(16)?.into();
        let ttl = reader.read_var::<u32>(32)?;
        let rdlength = reader.read_var::<u16>(16)?;
        let mut rdata = vec![0u8; rdlength as usize];
        reader.read_bytes(&mut rdata)?;
        Ok(Record {
            labels,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }
}
