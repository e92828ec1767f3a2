use crate::{
    error::{BufferError, Result},
    selector::Selector,
};
use candle_core::Tensor;

const PATH_SEPARATOR: char = '.';

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Tensor),
    Group(NestedBuffer),
}

impl From<Tensor> for Node {
    fn from(value: Tensor) -> Self {
        Node::Leaf(value)
    }
}

impl From<NestedBuffer> for Node {
    fn from(value: NestedBuffer) -> Self {
        Node::Group(value)
    }
}

/// An ordered tree of named tensors.
///
/// The key set is decided by whoever builds the tree. Reads, writes and transforms walk every
/// leaf with the same operation, so callers never have to know the schema. Writes are staged on
/// a copy of the tree (cloning a candle tensor only clones a handle) and committed once every
/// leaf succeeded.
#[derive(Debug, Clone, Default)]
pub struct NestedBuffer {
    entries: Vec<(String, Node)>,
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}{PATH_SEPARATOR}{key}")
    }
}

impl NestedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a top level entry, returning the replaced node.
    pub fn insert(&mut self, key: impl Into<String>, node: impl Into<Node>) -> Option<Node> {
        let key = key.into();
        let node = node.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, node)),
            None => {
                self.entries.push((key, node));
                None
            }
        }
    }

    pub fn with(mut self, key: impl Into<String>, node: impl Into<Node>) -> Self {
        self.insert(key, node);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, n)| (k.as_str(), n))
    }

    pub fn node(&self, key: &str) -> Option<&Node> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    fn node_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, n)| n)
    }

    /// Looks up a leaf by its dotted path, e.g. `observations.rgb`.
    pub fn leaf(&self, path: &str) -> Result<&Tensor> {
        let (group, key) = match path.rsplit_once(PATH_SEPARATOR) {
            Some((parent, key)) => (self.group(parent)?, key),
            None => (self, path),
        };
        match group.node(key) {
            Some(Node::Leaf(tensor)) => Ok(tensor),
            _ => Err(BufferError::MissingKey(path.to_owned())),
        }
    }

    /// Looks up a group by its dotted path.
    pub fn group(&self, path: &str) -> Result<&NestedBuffer> {
        let mut current = self;
        for key in path.split(PATH_SEPARATOR) {
            current = match current.node(key) {
                Some(Node::Group(group)) => group,
                _ => return Err(BufferError::MissingKey(path.to_owned())),
            };
        }
        Ok(current)
    }

    fn leaf_mut(&mut self, path: &str) -> Result<&mut Tensor> {
        let mut current = self;
        let mut keys = path.split(PATH_SEPARATOR).peekable();
        while let Some(key) = keys.next() {
            let is_last = keys.peek().is_none();
            match (current.node_mut(key), is_last) {
                (Some(Node::Leaf(tensor)), true) => return Ok(tensor),
                (Some(Node::Group(group)), false) => current = group,
                _ => break,
            }
        }
        Err(BufferError::MissingKey(path.to_owned()))
    }

    /// Dotted paths of every leaf, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.leaves().into_iter().map(|(path, _)| path).collect()
    }

    pub fn leaves(&self) -> Vec<(String, &Tensor)> {
        let mut leaves = vec![];
        self.collect_leaves("", &mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, prefix: &str, leaves: &mut Vec<(String, &'a Tensor)>) {
        for (key, node) in self.entries.iter() {
            let path = join(prefix, key);
            match node {
                Node::Leaf(tensor) => leaves.push((path, tensor)),
                Node::Group(group) => group.collect_leaves(&path, leaves),
            }
        }
    }

    /// The (time, simulator) dimensions shared by every leaf.
    pub fn leading_dims(&self) -> Result<(usize, usize)> {
        let leaves = self.leaves();
        let Some((first_path, first)) = leaves.first() else {
            return Err(BufferError::MissingKey("<empty buffer>".to_owned()));
        };
        let leading = |path: &str, tensor: &Tensor| match tensor.dims() {
            [t, n, ..] => Ok((*t, *n)),
            dims => Err(BufferError::ShapeMismatch {
                key: path.to_owned(),
                expected: vec![0, 0],
                actual: dims.to_vec(),
            }),
        };
        let expected = leading(first_path.as_str(), *first)?;
        for (path, tensor) in leaves.iter() {
            let dims = leading(path.as_str(), *tensor)?;
            if dims != expected {
                return Err(BufferError::ShapeMismatch {
                    key: path.clone(),
                    expected: vec![expected.0, expected.1],
                    actual: tensor.dims().to_vec(),
                });
            }
        }
        Ok(expected)
    }

    // The single traversal every per-leaf operation goes through.
    fn try_map_leaves<F>(&self, prefix: &str, f: &mut F) -> Result<NestedBuffer>
    where
        F: FnMut(&str, &Tensor) -> Result<Tensor>,
    {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (key, node) in self.entries.iter() {
            let path = join(prefix, key);
            let node = match node {
                Node::Leaf(tensor) => Node::Leaf(f(&path, tensor)?),
                Node::Group(group) => Node::Group(group.try_map_leaves(&path, f)?),
            };
            entries.push((key.clone(), node));
        }
        Ok(NestedBuffer { entries })
    }

    /// Indexes every leaf with the same selector and returns the sliced tree.
    pub fn get(&self, selector: impl Into<Selector>) -> Result<NestedBuffer> {
        let selector = selector.into();
        let (time_size, env_size) = self.leading_dims()?;
        selector.time.validate(0, time_size)?;
        selector.env.validate(1, env_size)?;
        self.try_map_leaves("", &mut |_: &str, tensor: &Tensor| {
            let mut sliced = selector.time.select(tensor, 0)?;
            sliced = selector.env.select(&sliced, 1)?;
            if selector.env.drops_dim() {
                sliced = sliced.squeeze(1)?;
            }
            if selector.time.drops_dim() {
                sliced = sliced.squeeze(0)?;
            }
            Ok(sliced)
        })
    }

    /// Writes `values` into the selected region of every leaf whose key is present in `values`.
    ///
    /// With `strict` the leaf key sets have to be identical, otherwise keys missing from `values`
    /// are left untouched and keys unknown to this buffer are ignored. Values are cast to the
    /// dtype and device of the destination leaf. Nothing is written unless every leaf succeeds.
    pub fn set(
        &mut self,
        selector: impl Into<Selector>,
        values: &NestedBuffer,
        strict: bool,
    ) -> Result<()> {
        let selector = selector.into();
        if strict {
            let mut expected = self.keys();
            let mut actual = values.keys();
            expected.sort();
            actual.sort();
            if expected != actual {
                return Err(BufferError::KeyMismatch { expected, actual });
            }
        }
        let (time_size, env_size) = self.leading_dims()?;
        selector.time.validate(0, time_size)?;
        selector.env.validate(1, env_size)?;
        let mut staged = self.clone();
        staged.write("", &selector, values, (time_size, env_size))?;
        *self = staged;
        Ok(())
    }

    fn write(
        &mut self,
        prefix: &str,
        selector: &Selector,
        values: &NestedBuffer,
        sizes: (usize, usize),
    ) -> Result<()> {
        for (key, node) in self.entries.iter_mut() {
            let Some(source) = values.node(key) else {
                continue;
            };
            let path = join(prefix, key);
            match (node, source) {
                (Node::Leaf(destination), Node::Leaf(source)) => {
                    *destination = write_leaf(&path, destination, selector, source, sizes)?;
                }
                (Node::Group(destination), Node::Group(source)) => {
                    destination.write(&path, selector, source, sizes)?;
                }
                (destination, _) => {
                    let expected = match destination {
                        Node::Leaf(_) => vec![path.clone()],
                        Node::Group(group) => group.keys().iter().map(|k| join(&path, k)).collect(),
                    };
                    return Err(BufferError::KeyMismatch {
                        expected,
                        actual: vec![path],
                    });
                }
            }
        }
        Ok(())
    }

    /// Builds a new tree of the same shape with every leaf transformed.
    pub fn map<F>(&self, mut f: F) -> Result<NestedBuffer>
    where
        F: FnMut(&Tensor) -> candle_core::Result<Tensor>,
    {
        self.try_map_leaves("", &mut |_: &str, tensor: &Tensor| Ok(f(tensor)?))
    }

    /// Replaces every leaf with its transform, e.g. a device move or a dtype cast.
    ///
    /// The transform must keep the leading (time, simulator) dimensions of each leaf.
    pub fn map_in_place<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&Tensor) -> candle_core::Result<Tensor>,
    {
        let staged = self.try_map_leaves("", &mut |path: &str, tensor: &Tensor| {
            let mapped = f(tensor)?;
            let rank = tensor.rank().min(2);
            if mapped.rank() < rank || mapped.dims()[..rank] != tensor.dims()[..rank] {
                return Err(BufferError::ShapeMismatch {
                    key: path.to_owned(),
                    expected: tensor.dims().to_vec(),
                    actual: mapped.dims().to_vec(),
                });
            }
            Ok(mapped)
        })?;
        *self = staged;
        Ok(())
    }

    /// Copies time slot `src` into time slot `dst` for every leaf.
    pub fn copy_slot(&mut self, dst: usize, src: usize) -> Result<()> {
        let slot = self.get(Selector::time(src))?;
        self.set(Selector::time(dst), &slot, true)
    }

    /// Swaps a single leaf for a tensor of identical shape.
    pub fn replace_leaf(&mut self, path: &str, tensor: Tensor) -> Result<()> {
        let leaf = self.leaf_mut(path)?;
        if leaf.dims() != tensor.dims() {
            return Err(BufferError::ShapeMismatch {
                key: path.to_owned(),
                expected: leaf.dims().to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        *leaf = tensor.to_dtype(leaf.dtype())?.to_device(leaf.device())?;
        Ok(())
    }
}

fn write_leaf(
    path: &str,
    destination: &Tensor,
    selector: &Selector,
    source: &Tensor,
    (time_size, env_size): (usize, usize),
) -> Result<Tensor> {
    let mut source = source
        .to_dtype(destination.dtype())?
        .to_device(destination.device())?;
    if selector.time.drops_dim() {
        source = source.unsqueeze(0)?;
    }
    if selector.env.drops_dim() {
        source = source.unsqueeze(1)?;
    }
    let feature_dims = &destination.dims()[2..];
    let mut expected = vec![selector.time.len(time_size), selector.env.len(env_size)];
    expected.extend_from_slice(feature_dims);
    if source.dims() != expected.as_slice() {
        return Err(BufferError::ShapeMismatch {
            key: path.to_owned(),
            expected,
            actual: source.dims().to_vec(),
        });
    }
    let mut written = destination.clone();
    for (time_offset, time_range) in selector.time.segments(time_size) {
        if time_range.is_empty() {
            continue;
        }
        for (env_offset, env_range) in selector.env.segments(env_size) {
            if env_range.is_empty() {
                continue;
            }
            let part = source
                .narrow(0, time_offset, time_range.len())?
                .narrow(1, env_offset, env_range.len())?;
            let mut ranges = vec![time_range.clone(), env_range];
            ranges.extend(feature_dims.iter().map(|d| 0..*d));
            written = written.slice_assign(ranges.as_slice(), &part)?;
        }
    }
    Ok(written)
}
