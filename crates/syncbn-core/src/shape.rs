use std::fmt;

// Shape — N-dimensional shape representation
//
// Normalization inputs are laid out as [N, C, *]: a batch dimension, a
// channel dimension, and any number of trailing spatial dimensions. All
// statistics are per channel, reduced over N and the trailing dims.
//
//   - Vector of channel stats: Shape([C])
//   - Gathered stats:          Shape([W, C])    (one row per worker)
//   - Conv activations:        Shape([N, C, H, W])

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Split an `[N, C, *]` shape into `(outer, channels, inner)` where
    /// `outer = N` and `inner` is the product of the trailing dims.
    ///
    /// Element `(n, c, s)` lives at flat index `(n * channels + c) * inner + s`.
    pub fn channel_split(&self) -> crate::Result<(usize, usize, usize)> {
        if self.rank() < 2 {
            return Err(crate::Error::InvalidInputRank { got: self.rank() });
        }
        let inner = self.0[2..].iter().product::<usize>();
        Ok((self.0[0], self.0[1], inner))
    }

    /// Number of samples that contribute to each channel's statistics.
    pub fn per_channel_count(&self) -> crate::Result<usize> {
        let (outer, _, inner) = self.channel_split()?;
        Ok(outer * inner)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
