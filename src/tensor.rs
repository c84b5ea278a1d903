use crate::device::{Buffer, DeviceContext};
use crate::error::Error;
use itertools::Itertools;
use smallvec::SmallVec;
use std::fmt::{Debug, Formatter};

pub type Extents = SmallVec<[usize; 5]>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataType {
    Float,
}

impl DataType {
    pub fn byte_size(&self) -> usize {
        match self {
            DataType::Float => 4,
        }
    }
}

/// Ordered extents plus element type of one graph tensor. Owned by the graph
/// executor; accelerators hold references during a call and may cache a copy
/// of the extents between calls.
#[derive(Clone, Eq, PartialEq)]
pub struct TensorDesc {
    extents: Extents,
    data_type: DataType,
}

impl TensorDesc {
    pub fn new<E>(extents: E, data_type: DataType) -> Self
    where
        E: IntoIterator<Item = usize>,
    {
        TensorDesc {
            extents: extents.into_iter().collect(),
            data_type,
        }
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn extent(&self, axis: usize) -> usize {
        self.extents[axis]
    }

    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    pub fn size(&self) -> usize {
        self.extents.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.size() * self.data_type.byte_size()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Extents normalized to rank-5 NCDHW; a rank-4 NCHW descriptor gains a
    /// unit depth axis so one convolution accelerator serves both layouts.
    pub fn as_ncdhw(&self) -> Result<[usize; 5], Error> {
        match *self.extents.as_slice() {
            [n, c, h, w] => Ok([n, c, 1, h, w]),
            [n, c, d, h, w] => Ok([n, c, d, h, w]),
            _ => Err(Error::shape(format!(
                "expected a rank-4 or rank-5 tensor, got rank {}",
                self.rank()
            ))),
        }
    }
}

impl Debug for TensorDesc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}]:{:?}",
            self.extents.iter().join(", "),
            self.data_type
        )
    }
}

/// A descriptor bound to a resolved device buffer. Created and resized by the
/// surrounding graph executor, never by an accelerator.
#[derive(Debug)]
pub struct Tensor {
    desc: TensorDesc,
    data: Buffer,
}

impl Tensor {
    /// Allocates a zero-filled device tensor on `ctx`.
    pub fn zeros(ctx: &DeviceContext, desc: TensorDesc) -> Result<Self, Error> {
        let data = ctx.alloc(desc.byte_size())?;
        Ok(Tensor { desc, data })
    }

    /// Uploads `data` into a freshly allocated device tensor on `ctx`.
    pub fn from_slice(ctx: &DeviceContext, desc: TensorDesc, data: &[f32]) -> Result<Self, Error> {
        if data.len() != desc.size() {
            return Err(Error::config(format!(
                "tensor data has {} elements, descriptor {:?} implies {}",
                data.len(),
                desc,
                desc.size()
            )));
        }
        let buffer = ctx.alloc(desc.byte_size())?;
        buffer.write(data)?;
        Ok(Tensor { desc, data: buffer })
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn data(&self) -> &Buffer {
        &self.data
    }

    /// Copies the device buffer back into host memory.
    pub fn to_vec(&self) -> Result<Vec<f32>, Error> {
        Ok(self.data.read()?)
    }
}

#[cfg(test)]
mod tests {
    use super::{DataType, TensorDesc};
    use crate::error::Error;

    #[test]
    fn rank_4_gains_unit_depth() {
        let desc = TensorDesc::new([2, 3, 5, 4], DataType::Float);
        assert_eq!(desc.as_ncdhw().unwrap(), [2, 3, 1, 5, 4]);
    }

    #[test]
    fn rank_5_passes_through() {
        let desc = TensorDesc::new([2, 3, 7, 5, 4], DataType::Float);
        assert_eq!(desc.as_ncdhw().unwrap(), [2, 3, 7, 5, 4]);
    }

    #[test]
    fn other_ranks_are_rejected() {
        let desc = TensorDesc::new([2, 3, 4], DataType::Float);
        assert!(matches!(desc.as_ncdhw(), Err(Error::Shape { .. })));
    }

    #[test]
    fn sizes() {
        let desc = TensorDesc::new([2, 3, 5, 4], DataType::Float);
        assert_eq!(desc.size(), 120);
        assert_eq!(desc.byte_size(), 480);
        assert_eq!(desc.rank(), 4);
        assert_eq!(desc.extent(1), 3);
    }
}
