/// A trait for vector-like types that can hold a packed state vector.
///
/// Page accessors that take or fill a state vector (delays, pre-history) are generic over
/// this trait so callers can keep their state in whatever linear algebra type they already
/// use. The packed layout is always contiguous, so every backend exposes its data as a
/// plain slice.
///
/// # Examples
///
/// ```rust
/// use evalexpr_ode::prelude::Vector;
///
/// // A zeroed state for a page with two states plus the independent variable
/// let state: Vec<f64> = Vector::zeros(3);
/// assert_eq!(state.len(), 3);
///
/// let mut state = vec![1.0, 2.0, 0.0];
/// state.as_mut_slice()[2] = 0.5;
/// assert_eq!(state.as_slice(), &[1.0, 2.0, 0.5]);
/// ```
pub trait Vector {
    /// Returns a reference to the vector's data as a slice.
    fn as_slice(&self) -> &[f64];

    /// Returns a mutable reference to the vector's data as a slice.
    fn as_mut_slice(&mut self) -> &mut [f64];

    /// Creates a new vector of the specified length filled with zeros.
    ///
    /// # Arguments
    /// * `len` - The length of the vector to create
    fn zeros(len: usize) -> Self;

    /// Returns the length of the vector.
    fn len(&self) -> usize;

    /// Checks if the vector is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Vector for Vec<f64> {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }

    fn zeros(len: usize) -> Self {
        vec![0.0; len]
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// Owned `Array1` values are always in standard layout, so slice access cannot fail.
#[cfg(feature = "ndarray")]
impl Vector for ndarray::Array1<f64> {
    fn as_slice(&self) -> &[f64] {
        ndarray::Array1::as_slice(self).expect("owned Array1 is contiguous")
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self.as_slice_mut().expect("owned Array1 is contiguous")
    }

    fn zeros(len: usize) -> Self {
        ndarray::Array1::zeros(len)
    }

    fn len(&self) -> usize {
        ndarray::Array1::len(self)
    }
}

#[cfg(feature = "nalgebra")]
impl Vector for nalgebra::DVector<f64> {
    fn as_slice(&self) -> &[f64] {
        nalgebra::DVector::as_slice(self)
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        nalgebra::DVector::as_mut_slice(self)
    }

    fn zeros(len: usize) -> Self {
        nalgebra::DVector::zeros(len)
    }

    fn len(&self) -> usize {
        nalgebra::DVector::len(self)
    }
}

/// Fixed-size arrays, for pages whose state length is known at compile time.
///
/// # Examples
///
/// ```rust
/// use evalexpr_ode::prelude::Vector;
///
/// let mut state = <[f64; 3]>::zeros(3);
/// state.as_mut_slice()[0] = 1.0;
/// assert_eq!(state[0], 1.0);
/// ```
impl<const N: usize> Vector for [f64; N] {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }

    fn zeros(len: usize) -> Self {
        assert_eq!(len, N, "Array length must match const generic size");
        [0.0; N]
    }

    fn len(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_backend() {
        let mut state = <Vec<f64> as Vector>::zeros(4);
        state.as_mut_slice()[3] = 2.0;
        assert_eq!(Vector::len(&state), 4);
        assert_eq!(Vector::as_slice(&state), &[0.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_array_backend() {
        let state = <[f64; 2] as Vector>::zeros(2);
        assert!(!Vector::is_empty(&state));
    }
}
