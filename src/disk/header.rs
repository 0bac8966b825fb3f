use std::fmt;
use std::io;

use crate::disk::block::{BlockDeviceRef, Location};
use crate::disk::{Id, DISK_NAME_SIZE, PADDING_BYTE};
use crate::petscii::Petscii;

/// A HeaderFormat describes where the pieces of the disk header live within
/// the header sector.
#[derive(Debug)]
pub struct HeaderFormat {
    pub location: Location,
    // offsets
    pub first_directory_offset: usize,
    pub dos_version_offset: usize,
    pub disk_name_offset: usize,
    pub disk_id_offset: usize,
    pub dos_type_offset: usize,
    pub padding_offsets: &'static [u8],
    // values written when formatting
    pub default_dos_version: u8,
    pub default_dos_type: [u8; 2],
}

/// The disk header: name, ID, and DOS markers, stored in the BAM sector on
/// the 1541.  Reading is permissive -- CBM DOS itself will happily read
/// disks whose marker bytes diverge from the values it writes when
/// formatting, and plenty of real images do.
pub struct Header {
    // The format documents say not to trust this field; the directory
    // always starts at (18,1) in practice.
    pub first_directory_sector: Location,
    pub dos_version: u8,
    pub disk_name: Petscii,
    pub disk_id: Id,
    pub dos_type: Id,
}

impl Header {
    pub fn new(format: &HeaderFormat, name: &Petscii, id: &Id) -> Header {
        Header {
            first_directory_sector: Location(18, 1),
            dos_version: format.default_dos_version,
            disk_name: name.clone(),
            disk_id: *id,
            dos_type: Id::from_bytes(&format.default_dos_type),
        }
    }

    /// Read a header from disk using the provided header format.
    pub fn read(blocks: BlockDeviceRef, format: &HeaderFormat) -> io::Result<Header> {
        let blocks = blocks.borrow();
        let block = blocks.sector(format.location)?;

        Ok(Header {
            first_directory_sector: Location::from_bytes(&block[format.first_directory_offset..]),
            dos_version: block[format.dos_version_offset],
            disk_name: Petscii::from_padded_bytes(
                &block[format.disk_name_offset..format.disk_name_offset + DISK_NAME_SIZE],
                PADDING_BYTE,
            ),
            disk_id: Id::from_bytes(&block[format.disk_id_offset..format.disk_id_offset + 2]),
            dos_type: Id::from_bytes(&block[format.dos_type_offset..format.dos_type_offset + 2]),
        })
    }

    /// Write the header into the image.  Only the regions corresponding to
    /// the fields we know about are touched, preserving any non-standard
    /// bytes elsewhere in the sector.
    pub fn write(&self, blocks: BlockDeviceRef, format: &HeaderFormat) -> io::Result<()> {
        let mut block = blocks.borrow().sector(format.location)?.to_vec();

        self.first_directory_sector
            .write_bytes(&mut block[format.first_directory_offset..]);
        block[format.dos_version_offset] = self.dos_version;
        self.disk_name.write_bytes_with_padding(
            &mut block[format.disk_name_offset..format.disk_name_offset + DISK_NAME_SIZE],
            PADDING_BYTE,
        );
        block[format.disk_id_offset] = self.disk_id[0];
        block[format.disk_id_offset + 1] = self.disk_id[1];
        block[format.dos_type_offset] = self.dos_type[0];
        block[format.dos_type_offset + 1] = self.dos_type[1];

        // Certain surrounding bytes must hold the padding byte (0xA0), or
        // directory listings generated by CBM DOS come out garbled on the
        // name and "blocks free" lines.
        for padding_offset in format.padding_offsets {
            block[*padding_offset as usize] = PADDING_BYTE;
        }

        blocks
            .borrow_mut()
            .sector_mut(format.location)?
            .copy_from_slice(&block);
        Ok(())
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "disk name: {:?}", self.disk_name)?;
        writeln!(f, "disk id: {}", self.disk_id)?;
        writeln!(f, "dos type: {}", self.dos_type)
    }
}
