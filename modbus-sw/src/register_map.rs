//! Coalescing of sparse register addresses into one contiguous bulk read.
//!
//! The transport only offers contiguous reads, and the boards on the bus
//! expose small, nearly contiguous address sets, so a device's coils (or
//! inputs) are always fetched with a single span read. Values read for
//! addresses that are not configured are discarded when scattering.

/// A contiguous `(start, count)` range of register addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpan {
    pub start: u16,
    pub count: u16,
}

impl RegisterSpan {
    /// Smallest span covering every address in `addresses`.
    ///
    /// Returns `None` for an empty set, in which case no bus call is made.
    ///
    /// ```
    /// use modbus_sw::register_map::RegisterSpan;
    ///
    /// let span = RegisterSpan::covering([2, 5, 7]).unwrap();
    /// assert_eq!((span.start, span.count), (2, 6));
    /// assert!(RegisterSpan::covering([]).is_none());
    /// ```
    pub fn covering<I>(addresses: I) -> Option<Self>
    where
        I: IntoIterator<Item = u16>,
    {
        let mut addresses = addresses.into_iter();
        let first = addresses.next()?;
        let (min, max) = addresses.fold((first, first), |(min, max), address| {
            (min.min(address), max.max(address))
        });

        Some(Self {
            start: min,
            count: max - min + 1,
        })
    }

    /// Last address covered by the span.
    pub fn end(&self) -> u16 {
        self.start + self.count - 1
    }

    /// Pair each value of a span read with the address it was read from.
    ///
    /// Result index `i` maps to address `start + i`. A response longer than
    /// the span is clipped; a short response only yields what it covers.
    pub fn scatter<'a, T: Copy>(
        &self,
        values: &'a [T],
    ) -> impl Iterator<Item = (u16, T)> + 'a {
        let start = self.start;
        values
            .iter()
            .take(self.count as usize)
            .zip(start..)
            .map(|(value, address)| (address, *value))
    }
}

impl std::fmt::Display for RegisterSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "from:{} count:{}", self.start, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_sparse_addresses() {
        let span = RegisterSpan::covering([7, 2, 5]).unwrap();
        assert_eq!(span, RegisterSpan { start: 2, count: 6 });
        assert_eq!(span.end(), 7);
    }

    #[test]
    fn test_covering_single_address() {
        let span = RegisterSpan::covering([31]).unwrap();
        assert_eq!(span, RegisterSpan { start: 31, count: 1 });
    }

    #[test]
    fn test_covering_empty() {
        assert_eq!(RegisterSpan::covering(Vec::<u16>::new()), None);
    }

    #[test]
    fn test_scatter_offsets_by_start() {
        let span = RegisterSpan::covering([2, 5, 7]).unwrap();
        let values = [true, false, false, true, false, true];

        let configured = [2, 5, 7];
        let applied: Vec<(u16, bool)> = span
            .scatter(&values)
            .filter(|(address, _)| configured.contains(address))
            .collect();

        assert_eq!(applied, vec![(2, true), (5, true), (7, true)]);
    }

    #[test]
    fn test_scatter_short_and_long_responses() {
        let span = RegisterSpan { start: 1, count: 3 };

        let short: Vec<(u16, u16)> = span.scatter(&[10, 20]).collect();
        assert_eq!(short, vec![(1, 10), (2, 20)]);

        let long: Vec<(u16, u16)> = span.scatter(&[10, 20, 30, 40, 50]).collect();
        assert_eq!(long, vec![(1, 10), (2, 20), (3, 30)]);
    }
}
