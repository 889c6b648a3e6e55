use core::fmt;

/// Address type, as signaled by the `TxAdd`/`RxAdd` bits of an advertising header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddressKind {
    /// IEEE-assigned MAC address.
    Public,
    /// Static or private random address.
    Random,
}

impl AddressKind {
    pub fn from_bit(random: bool) -> Self {
        if random {
            AddressKind::Random
        } else {
            AddressKind::Public
        }
    }
}

/// A 48-bit device address, as found in advertising PDUs.
///
/// Bytes are stored in on-air order, least significant first. `Debug` prints the conventional
/// colon-separated form.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    bytes: [u8; 6],
    kind: AddressKind,
}

impl DeviceAddress {
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        DeviceAddress { bytes, kind }
    }

    /// Builds an address from its written form: `aa:bb:cc:dd:ee:ff` is
    /// `[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]`.
    pub fn from_display_order(mut bytes: [u8; 6], kind: AddressKind) -> Self {
        bytes.reverse();
        DeviceAddress { bytes, kind }
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn raw(&self) -> &[u8; 6] {
        &self.bytes
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x} ({:?})",
            g, e, d, c, b, a, self.kind
        )
    }
}
