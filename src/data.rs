//! byte-level packing of the values carried by PDUs, registers and mailbox payloads

use core::{
	marker::PhantomData,
	fmt,
	};

/// value with a fixed little-endian representation on the wire
pub trait PduData: Sized {
    const ID: TypeId;
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize  {Self::Packed::LEN}
    fn packed_bitsize() -> usize {Self::Packed::LEN*8}
}

/// reason a value cannot be packed to or unpacked from a byte slice
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PackingError {
    BadSize(usize, &'static str),
    BadAlignment(usize, &'static str),
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;


/// fixed size byte array holding a packed value, `[u8; N]` is the only implementor
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self {[0; N]}
}

/// runtime tag of the primitive types implementing [PduData], anything else is [TypeId::CUSTOM]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TypeId {
	CUSTOM,
	VOID, BOOL,
	I8, I16, I32, I64,
	U8, U16, U32, U64,
	F32, F64,
}

/// first `len` bytes of `data`, or [PackingError::BadSize]
pub(crate) fn prefix<'a>(data: &'a [u8], len: usize, what: &'static str) -> PackingResult<&'a [u8]> {
    data.get(.. len).ok_or(PackingError::BadSize(data.len(), what))
}
/// first `len` bytes of `data` for writing, or [PackingError::BadSize]
pub(crate) fn prefix_mut<'a>(data: &'a mut [u8], len: usize, what: &'static str) -> PackingResult<&'a mut [u8]> {
    let available = data.len();
    data.get_mut(.. len).ok_or(PackingError::BadSize(available, what))
}

impl<const N: usize> PduData for [u8; N] {
    const ID: TypeId = TypeId::CUSTOM;
    type Packed = Self;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        prefix_mut(dst, N, "byte array longer than destination")?.copy_from_slice(self);
        Ok(())
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        let mut value = [0; N];
        value.copy_from_slice(prefix(src, N, "byte array longer than source")?);
        Ok(value)
    }
}

impl PduData for () {
    const ID: TypeId = TypeId::VOID;
    type Packed = [u8; 0];

    fn pack(&self, _: &mut [u8]) -> PackingResult<()>  {Ok(())}
    fn unpack(_: &[u8]) -> PackingResult<Self>  {Ok(())}
}

/// one byte, only the lowest bit is significant
impl PduData for bool {
    const ID: TypeId = TypeId::BOOL;
    type Packed = [u8; 1];

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        u8::from(*self).pack(dst)
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        u8::unpack(src).map(|byte| byte & 1 != 0)
    }
}

/// [PduData] for a `Copy` bitfield declared with `bilge`, packed as its byte-sized base integer
macro_rules! bilge_pdudata {
    ($t: ty, $id: ty) => { impl crate::data::PduData for $t {
        const ID: crate::data::TypeId = crate::data::TypeId::CUSTOM;
        type Packed = [u8; core::mem::size_of::<$id>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            crate::data::PduData::pack(&<$id>::from(*self), dst)
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            <$id as crate::data::PduData>::unpack(src).map(Self::from)
        }
    }};
}
pub(crate) use bilge_pdudata;

/// [PduData] for primitive numbers, little endian
macro_rules! num_pdudata {
    ($($t: ty => $id: ident),* $(,)?) => {$(
        impl crate::data::PduData for $t {
            const ID: crate::data::TypeId = crate::data::TypeId::$id;
            type Packed = [u8; core::mem::size_of::<$t>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                let bytes = self.to_le_bytes();
                crate::data::prefix_mut(dst, bytes.len(), "number longer than destination")?
                    .copy_from_slice(&bytes);
                Ok(())
            }
            fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
                let mut bytes = [0; core::mem::size_of::<$t>()];
                bytes.copy_from_slice(crate::data::prefix(src, core::mem::size_of::<$t>(), "number longer than source")?);
                Ok(Self::from_le_bytes(bytes))
            }
        }
    )*};
}

/**
    macro declaring an enum of known codes carried by an integer on the wire, with a fallback variant `Other` for codes not listed

    It implements the conversions to/from the base integer and [PduData]
*/
macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        pub enum $name: ident: $base: ty {
            $( $(#[$doc: meta])* $variant: ident = $code: literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum $name {
            $( $(#[$doc])* $variant, )*
            /// code not known by this master
            Other($base),
        }
        impl From<$base> for $name {
            fn from(code: $base) -> Self {
                match code {
                    $( $code => Self::$variant, )*
                    other => Self::Other(other),
                }
            }
        }
        impl From<$name> for $base {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $code, )*
                    $name::Other(other) => other,
                }
            }
        }
        impl crate::data::PduData for $name {
            const ID: crate::data::TypeId = crate::data::TypeId::CUSTOM;
            type Packed = [u8; core::mem::size_of::<$base>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                crate::data::PduData::pack(&<$base>::from(*self), dst)
            }
            fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
                <$base as crate::data::PduData>::unpack(src).map(Self::from)
            }
        }
    };
}
pub(crate) use code_enum;

num_pdudata!{
    u8 => U8, u16 => U16, u32 => U32, u64 => U64, u128 => CUSTOM,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
}



/**
	typed location of a value in a byte sequence: a register in the slave memory, an item in a mailbox payload

	It holds no data, only the byte offset and length, and [Self::get]/[Self::set] check both against the slice they are given.
*/
#[derive(Default, Eq, Hash)]
pub struct Field<T: PduData> {
    /// offset of the first byte
    pub byte: usize,
    /// size in bytes, may differ from the packed size of `T` for variable length items
    pub len: usize,
    value: PhantomData<T>,
}
impl<T: PduData> Field<T>
{
	/// field of `len` bytes at offset `byte`
	pub const fn new(byte: usize, len: usize) -> Self {
		Self {byte, len, value: PhantomData}
	}
	/// field at offset `byte`, as long as the packed `T`
	pub const fn simple(byte: usize) -> Self {
		Self::new(byte, T::Packed::LEN)
	}
	/// byte range covered by this field
	pub fn range(&self) -> core::ops::Range<usize> {
		self.byte .. self.byte + self.len
	}

	/// read the value from `data`
	pub fn get(&self, data: &[u8]) -> PackingResult<T> {
		T::unpack(data.get(self.range())
            .ok_or(PackingError::BadSize(data.len(), "field out of data bounds"))?)
	}
	/// write the value into `data`
	pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()> {
        let size = data.len();
        value.pack(data.get_mut(self.range())
            .ok_or(PackingError::BadSize(size, "field out of data bounds"))?)
	}
}
impl<T: PduData> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("byte", &format_args!("{:#x}", self.byte))
            .field("len", &self.len)
            .finish()
    }
}
// derives would require `T: Copy`
impl<T: PduData> Clone for Field<T> {
    fn clone(&self) -> Self  {*self}
}
impl<T: PduData> Copy for Field<T> {}
impl<T: PduData> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool  {self.range() == other.range()}
}



/** sequential reader and writer of [PduData] values over a byte slice

    Reads return borrowed slices, nothing is copied. Every read or write past the end of the slice is reported as [PackingError::BadSize] and leaves the position unchanged.
*/
pub struct Cursor<T> {
    data: T,
    offset: usize,
}
impl<T: AsRef<[u8]>> Cursor<T> {
    pub fn new(data: T) -> Self  {Self {data, offset: 0}}
    /// number of bytes already read or written
    pub fn position(&self) -> usize  {self.offset}
    /// number of bytes remaining after the current position
    pub fn remaining(&self) -> usize  {self.data.as_ref().len() - self.offset}

    fn advance(&mut self, size: usize) -> PackingResult<core::ops::Range<usize>> {
        let start = self.offset;
        let end = start + size;
        if end > self.data.as_ref().len()
            {return Err(PackingError::BadSize(self.data.as_ref().len(), "cursor reached the end of data"))}
        self.offset = end;
        Ok(start .. end)
    }

    /// read a value and move past it
    pub fn unpack<D: PduData>(&mut self) -> PackingResult<D> {
        let range = self.advance(D::Packed::LEN)?;
        D::unpack(&self.data.as_ref()[range])
    }
    /// borrow the next `size` bytes and move past them
    pub fn read(&mut self, size: usize) -> PackingResult<&[u8]> {
        let range = self.advance(size)?;
        Ok(&self.data.as_ref()[range])
    }
    /// bytes after the position, without moving
    pub fn remain(&self) -> &'_ [u8] {
        &self.data.as_ref()[self.offset ..]
    }
}
impl<T: AsRef<[u8]> + AsMut<[u8]>> Cursor<T> {
    /// write a value and move past it
    pub fn pack<D: PduData>(&mut self, value: &D) -> PackingResult<()> {
        let range = self.advance(D::Packed::LEN)?;
        value.pack(&mut self.data.as_mut()[range])
    }
    /// copy raw bytes and move past them
    pub fn write(&mut self, value: &[u8]) -> PackingResult<()> {
        let range = self.advance(value.len())?;
        self.data.as_mut()[range].copy_from_slice(value);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_bounds() {
        let mut data = [0u8; 6];
        let field = Field::<u32>::simple(2);
        field.set(&mut data, 0x0403_0201).unwrap();
        assert_eq!(data, [0, 0, 1, 2, 3, 4]);
        assert_eq!(field.get(&data).unwrap(), 0x0403_0201);

        let outside = Field::<u32>::simple(4);
        assert!(outside.get(&data).is_err());
        assert!(outside.set(&mut data, 1).is_err());
    }

    #[test]
    fn cursor_sequence() {
        let mut buffer = [0u8; 7];
        let mut cursor = Cursor::new(&mut buffer[..]);
        cursor.pack(&0x1234u16).unwrap();
        cursor.write(&[5, 6, 7]).unwrap();
        cursor.pack(&true).unwrap();
        assert_eq!(cursor.position(), 6);
        assert!(cursor.pack(&0u16).is_err());
        assert_eq!(cursor.position(), 6);

        let mut cursor = Cursor::new(&buffer[..]);
        assert_eq!(cursor.unpack::<u16>().unwrap(), 0x1234);
        assert_eq!(cursor.read(3).unwrap(), &[5, 6, 7]);
        assert_eq!(cursor.unpack::<bool>().unwrap(), true);
        assert_eq!(cursor.remaining(), 1);
        assert!(cursor.read(2).is_err());
    }
}
