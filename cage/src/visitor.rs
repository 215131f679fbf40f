use std::ptr::NonNull;

/// Receives every root reported during a trace.
pub trait RootVisitor {
    fn visit_root(&mut self, object: NonNull<u8>);

    #[inline]
    fn visit_optional_root(&mut self, object: Option<NonNull<u8>>) {
        if let Some(object) = object {
            self.visit_root(object);
        }
    }
}

impl<F> RootVisitor for F
where
    F: FnMut(NonNull<u8>),
{
    #[inline]
    fn visit_root(&mut self, object: NonNull<u8>) {
        self(object)
    }
}

/// Collects roots into a vector. Mostly useful in tests and tools.
#[derive(Debug, Default)]
pub struct RootCollector {
    pub roots: Vec<NonNull<u8>>,
}

impl RootVisitor for RootCollector {
    fn visit_root(&mut self, object: NonNull<u8>) {
        self.roots.push(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_visitors() {
        let mut value = 5u8;
        let ptr = NonNull::from(&mut value);
        let mut seen = 0;
        let mut visitor = |_: NonNull<u8>| seen += 1;
        visitor.visit_root(ptr);
        visitor.visit_optional_root(None);
        visitor.visit_optional_root(Some(ptr));
        assert_eq!(seen, 2);
    }

    #[test]
    fn collector_keeps_order() {
        let mut a = 1u8;
        let mut b = 2u8;
        let mut collector = RootCollector::default();
        collector.visit_root(NonNull::from(&mut a));
        collector.visit_root(NonNull::from(&mut b));
        assert_eq!(collector.roots.len(), 2);
        assert_eq!(unsafe { *collector.roots[1].as_ptr() }, 2);
    }
}
