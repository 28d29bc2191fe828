use bitstream_io::{BitRead, BitReader, BitWrite, BitWriter, Endianness};

use super::{
    ParseError, labels_to_name, name_to_labels, read_name, write_labels,
    enums::{RecordClass, RecordType},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Question {
    pub labels: Vec<String>,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl Question {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        Question {
            labels: name_to_labels(name),
            qtype,
            qclass: RecordClass::IN,
        }
    }

    /// Dotted, lowercased owner name without the trailing root dot.
    pub fn name(&self) -> String {
        labels_to_name(&self.labels)
    }

    pub fn set_name(&mut self, name: &str) {
        self.labels = name_to_labels(name);
    }

    pub(super) fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError> {
        write_labels(writer, &self.labels)?;
        writer.write_var::<u16>(16, self.qtype.into())?;
        writer.write_var::<u16>(16, self.qclass.into())?;
        Ok(())
    }

    pub(super) fn read<E: Endianness>(
        reader: &mut BitReader<&[u8], E>,
        packet: &[u8],
    ) -> Result<Self, ParseError> {
        let labels = read_name(reader, packet)?;
        let qtype = reader.read_var::<u16>(16)?.into();
        let qclass = reader.read_var::<u16>(16)?.into();
        Ok(Question {
            labels,
            qtype,
            qclass,
        })
    }
}
