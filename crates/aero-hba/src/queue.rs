//! Index-based FIFO of commands.
//!
//! Nodes live in an arena (`Vec<Node>` plus a free list) and are linked by index in both
//! directions, so removing a command by identity never leaves a dangling link. The queue
//! owns the commands it holds; taking a command out hands ownership back to the caller.

use crate::command::{Command, CommandFlags, CommandId};

/// Position of a queued command. Only valid until that command is taken out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueIndex(usize);

#[derive(Debug)]
struct Node {
    cmd: Option<Command>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, mut cmd: Command) -> usize {
        debug_assert!(
            !cmd.flags.contains(CommandFlags::QUEUED),
            "command {} is already linked into a queue",
            cmd.id()
        );
        cmd.flags.insert(CommandFlags::QUEUED);
        let node = Node {
            cmd: Some(cmd),
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    pub(crate) fn push_back(&mut self, cmd: Command) {
        let idx = self.alloc(cmd);
        self.nodes[idx].prev = self.tail;
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    pub(crate) fn push_front(&mut self, cmd: Command) {
        let idx = self.alloc(cmd);
        self.nodes[idx].next = self.head;
        match self.head {
            Some(head) => self.nodes[head].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    fn insert_after(&mut self, prev: usize, cmd: Command) {
        let idx = self.alloc(cmd);
        let next = self.nodes[prev].next;
        self.nodes[idx].prev = Some(prev);
        self.nodes[idx].next = next;
        self.nodes[prev].next = Some(idx);
        match next {
            Some(n) => self.nodes[n].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.len += 1;
    }

    /// Links `cmd` at the back, or, if it carries [`CommandFlags::HEAD`], behind the run of
    /// `HEAD` commands already at the front. Head commands keep their arrival order.
    pub(crate) fn push(&mut self, cmd: Command) {
        if !cmd.flags.contains(CommandFlags::HEAD) {
            self.push_back(cmd);
            return;
        }
        let mut last_head = None;
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if !node
                .cmd
                .as_ref()
                .is_some_and(|c| c.flags.contains(CommandFlags::HEAD))
            {
                break;
            }
            last_head = Some(idx);
            cur = node.next;
        }
        match last_head {
            Some(prev) => self.insert_after(prev, cmd),
            None => self.push_front(cmd),
        }
    }

    pub(crate) fn first(&self) -> Option<QueueIndex> {
        self.head.map(QueueIndex)
    }

    pub(crate) fn next(&self, idx: QueueIndex) -> Option<QueueIndex> {
        self.nodes[idx.0].next.map(QueueIndex)
    }

    pub(crate) fn get(&self, idx: QueueIndex) -> Option<&Command> {
        self.nodes.get(idx.0).and_then(|n| n.cmd.as_ref())
    }

    /// Unlinks the command at `idx`.
    pub(crate) fn take(&mut self, idx: QueueIndex) -> Option<Command> {
        let node = self.nodes.get_mut(idx.0)?;
        let mut cmd = node.cmd.take()?;
        let (prev, next) = (node.prev.take(), node.next.take());

        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }

        self.free.push(idx.0);
        self.len -= 1;
        cmd.flags.remove(CommandFlags::QUEUED);
        Some(cmd)
    }

    pub(crate) fn pop_front(&mut self) -> Option<Command> {
        let idx = self.first()?;
        self.take(idx)
    }

    pub(crate) fn position(&self, id: CommandId) -> Option<QueueIndex> {
        let mut cur = self.first();
        while let Some(idx) = cur {
            if self.get(idx).is_some_and(|c| c.id() == id) {
                return Some(idx);
            }
            cur = self.next(idx);
        }
        None
    }

    pub(crate) fn contains(&self, id: CommandId) -> bool {
        self.position(id).is_some()
    }

    /// O(n) removal by identity.
    pub(crate) fn remove(&mut self, id: CommandId) -> Option<Command> {
        let idx = self.position(id)?;
        self.take(idx)
    }

    /// Unlinks every command matching `pred`, preserving queue order in the result.
    pub(crate) fn drain_where<F>(&mut self, mut pred: F) -> Vec<Command>
    where
        F: FnMut(&Command) -> bool,
    {
        let mut out = Vec::new();
        let mut cur = self.first();
        while let Some(idx) = cur {
            cur = self.next(idx);
            if self.get(idx).is_some_and(&mut pred) {
                out.extend(self.take(idx));
            }
        }
        out
    }

    pub(crate) fn ids(&self) -> Vec<CommandId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.first();
        while let Some(idx) = cur {
            out.extend(self.get(idx).map(Command::id));
            cur = self.next(idx);
        }
        out
    }
}
