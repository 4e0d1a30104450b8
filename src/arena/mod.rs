// Arena-based storage for running tasks
//
// Each store owns one TaskArena behind an Rc<RefCell<..>>. Tasks hold a weak
// reference to it and their TaskId, which is enough to cancel a subtree or to
// register disposers without any Rc cycle between parents and children.

pub(crate) mod task_arena;

pub(crate) use task_arena::{Disposer, DisposerKey, TaskArena, TaskId};
