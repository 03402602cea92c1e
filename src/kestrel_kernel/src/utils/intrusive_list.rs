//! Intrusive doubly-linked lists over pool slots.
//!
//! Every control block lives in a statically-sized pool, so list membership is
//! expressed with pool indices rather than pointers: each participating slot
//! embeds one or more `Option<Link>` fields, and a list is anchored by a
//! [`ListHead`] holding the indices of the first and last elements. A slot
//! whose link field is `None` is not on the list that field belongs to.
//!
//! [`ListAccessor`] borrows a head and the backing slice together and performs
//! the actual pointer surgery. Structural inconsistencies (double insertion,
//! removal of an unlinked element, a neighbor with a missing link) are
//! reported as [`ListError`] instead of being allowed to corrupt the lists.
use super::Init;

/// Identifies a slot within one of the kernel's pools.
pub(crate) type Index = u16;

/// An embedded list node. `prev`/`next` are pool indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    pub prev: Option<Index>,
    pub next: Option<Index>,
}

/// The anchor of one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListHead {
    pub first: Option<Index>,
    pub last: Option<Index>,
}

impl Init for ListHead {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl ListHead {
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListError {
    /// The element is already on a list.
    AlreadyLinked,
    /// The element is not on this list.
    NotLinked,
    /// A neighboring element's link field was `None`.
    Broken,
}

/// Borrows a [`ListHead`] and the pool slice containing its elements, with
/// `map_link` projecting a slot to the link field this list threads through.
pub(crate) struct ListAccessor<'a, T, F> {
    head: &'a mut ListHead,
    pool: &'a mut [T],
    map_link: F,
}

impl<'a, T, F> ListAccessor<'a, T, F>
where
    F: Fn(&mut T) -> &mut Option<Link>,
{
    #[inline]
    pub(crate) fn new(head: &'a mut ListHead, pool: &'a mut [T], map_link: F) -> Self {
        Self {
            head,
            pool,
            map_link,
        }
    }

    #[inline]
    fn link(&mut self, i: Index) -> &mut Option<Link> {
        (self.map_link)(&mut self.pool[usize::from(i)])
    }

    #[inline]
    pub(crate) fn front(&self) -> Option<Index> {
        self.head.first
    }

    pub(crate) fn push_back(&mut self, i: Index) -> Result<(), ListError> {
        self.insert(i, None)
    }

    pub(crate) fn push_front(&mut self, i: Index) -> Result<(), ListError> {
        let first = self.head.first;
        self.insert(i, first)
    }

    /// Insert `i` immediately before `at`. `at == None` appends at the back.
    pub(crate) fn insert(&mut self, i: Index, at: Option<Index>) -> Result<(), ListError> {
        if self.link(i).is_some() {
            return Err(ListError::AlreadyLinked);
        }

        match at {
            None => {
                let prev = self.head.last;
                *self.link(i) = Some(Link { prev, next: None });
                match prev {
                    Some(p) => match self.link(p) {
                        Some(l) => l.next = Some(i),
                        None => return Err(ListError::Broken),
                    },
                    None => self.head.first = Some(i),
                }
                self.head.last = Some(i);
            }
            Some(at) => {
                let prev = match *self.link(at) {
                    Some(l) => l.prev,
                    None => return Err(ListError::NotLinked),
                };
                *self.link(i) = Some(Link {
                    prev,
                    next: Some(at),
                });
                match self.link(at) {
                    Some(l) => l.prev = Some(i),
                    None => return Err(ListError::Broken),
                }
                match prev {
                    Some(p) => match self.link(p) {
                        Some(l) => l.next = Some(i),
                        None => return Err(ListError::Broken),
                    },
                    None => self.head.first = Some(i),
                }
            }
        }

        Ok(())
    }

    pub(crate) fn pop_front(&mut self) -> Option<Index> {
        let i = self.front()?;
        let removed = self.remove(i);
        debug_assert!(removed.is_ok());
        Some(i)
    }

    pub(crate) fn remove(&mut self, i: Index) -> Result<(), ListError> {
        let link = match self.link(i).take() {
            Some(l) => l,
            None => return Err(ListError::NotLinked),
        };

        match link.prev {
            Some(p) => match self.link(p) {
                Some(l) => l.next = link.next,
                None => return Err(ListError::Broken),
            },
            None => self.head.first = link.next,
        }
        match link.next {
            Some(n) => match self.link(n) {
                Some(l) => l.prev = link.prev,
                None => return Err(ListError::Broken),
            },
            None => self.head.last = link.prev,
        }

        Ok(())
    }

    pub(crate) fn next(&mut self, i: Index) -> Result<Option<Index>, ListError> {
        match *self.link(i) {
            Some(l) => Ok(l.next),
            None => Err(ListError::NotLinked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Node {
        link: Option<Link>,
    }

    fn link(n: &mut Node) -> &mut Option<Link> {
        &mut n.link
    }

    fn pool(n: usize) -> Vec<Node> {
        (0..n).map(|_| Node { link: None }).collect()
    }

    fn collect<F: Fn(&mut Node) -> &mut Option<Link>>(
        acc: &mut ListAccessor<'_, Node, F>,
    ) -> Vec<Index> {
        let mut out = Vec::new();
        let mut cur = acc.front();
        while let Some(i) = cur {
            out.push(i);
            cur = acc.next(i).unwrap();
        }
        out
    }

    #[test]
    fn push_pop_fifo() {
        let mut head = ListHead::INIT;
        let mut nodes = pool(4);
        let mut acc = ListAccessor::new(&mut head, &mut nodes, link);
        for i in 0..4 {
            acc.push_back(i).unwrap();
        }
        assert_eq!(collect(&mut acc), [0, 1, 2, 3]);
        assert_eq!(acc.pop_front(), Some(0));
        assert_eq!(acc.pop_front(), Some(1));
        acc.push_back(0).unwrap();
        assert_eq!(collect(&mut acc), [2, 3, 0]);
    }

    #[test]
    fn remove_from_middle() {
        let mut head = ListHead::INIT;
        let mut nodes = pool(3);
        let mut acc = ListAccessor::new(&mut head, &mut nodes, link);
        for i in 0..3 {
            acc.push_back(i).unwrap();
        }
        acc.remove(1).unwrap();
        assert_eq!(collect(&mut acc), [0, 2]);
        acc.remove(0).unwrap();
        acc.remove(2).unwrap();
        assert!(head.is_empty());
        assert_eq!(head.last, None);
    }

    #[test]
    fn insert_before() {
        let mut head = ListHead::INIT;
        let mut nodes = pool(4);
        let mut acc = ListAccessor::new(&mut head, &mut nodes, link);
        acc.push_back(0).unwrap();
        acc.push_back(1).unwrap();
        acc.insert(2, Some(1)).unwrap();
        acc.insert(3, Some(0)).unwrap();
        assert_eq!(collect(&mut acc), [3, 0, 2, 1]);
    }

    #[test]
    fn double_insert_and_stray_remove_are_rejected() {
        let mut head = ListHead::INIT;
        let mut nodes = pool(2);
        let mut acc = ListAccessor::new(&mut head, &mut nodes, link);
        acc.push_back(0).unwrap();
        assert_eq!(acc.push_back(0), Err(ListError::AlreadyLinked));
        assert_eq!(acc.remove(1), Err(ListError::NotLinked));
        assert_eq!(collect(&mut acc), [0]);
    }

    #[test]
    fn push_front_orders() {
        let mut head = ListHead::INIT;
        let mut nodes = pool(3);
        let mut acc = ListAccessor::new(&mut head, &mut nodes, link);
        acc.push_front(0).unwrap();
        acc.push_front(1).unwrap();
        acc.push_front(2).unwrap();
        assert_eq!(collect(&mut acc), [2, 1, 0]);
    }
}
