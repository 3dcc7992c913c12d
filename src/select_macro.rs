/// # Select one of multiple channel operations
///
/// select! supports three different clauses:
///
/// * `pattern = <-channel => code,`
/// * `pattern = channel<-expression => code,`
/// * `default => code,`
///
/// ## Restrictions
/// * `channel` must be an ident but not an expression.
/// * `pattern` must be irrefutable. Receive clauses bind a
///   `Result<T, RecvError>`, send clauses a `Result<(), SendError<T>>`.
///
/// ## Evaluation
/// * Expressions sent to a channel are evaluated before selection and move
///   into the losing branch's action if another clause wins.
/// * `default` case is run if no operation is ready without blocking. In its
///   absence the calling fiber parks until one becomes ready; a closed
///   channel counts as ready.
///
/// ## Examples
/// ```rust
/// use handoff::{select, Channel};
///
/// let numbers = Channel::new(1);
/// let mut sent = false;
/// select! {
///     _ = <-numbers => panic!("empty"),
///     _ = numbers<-1 => sent = true,
/// }
/// assert!(sent);
/// select! {
///     r = <-numbers => assert_eq!(r, Ok(1)),
///     default => panic!("buffered value pending"),
/// }
/// select! {
///     _ = <-numbers => panic!("empty"),
///     default => {},
/// }
/// ```
#[macro_export]
macro_rules! select {
    ($($tokens:tt)*) => {
        $crate::select_internal!(@list ($($tokens)*) ())
    }
}

// @list list clauses and normalize each body to the form `{ $body; }` with
// trailing comma.
// @case pattern match clauses, splitting `default` from the operations.
// @init generate initialization code.
// @add declare one action per operation, then run the coordinator.
// @match dispatch the winning index to its clause.
#[doc(hidden)]
#[macro_export]
macro_rules! select_internal {
    (@list
        ()
        $cases:tt
    ) => {
        $crate::select_internal!(
            @case
            $cases
            ()
            ()
        )
    };

    // `default` in last case.
    (@list
        (default => $body:expr)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ()
            ($($cases)* default => { $body; },)
        )
    };
    // `default` in no last case.
    (@list
        (default => $body:expr, $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ($($tokens)*)
            ($($cases)* default => { $body; },)
        )
    };

    // List operation case. `block` is a special kind of `expr`, match it first.

    // recv: Block with trailing comma.
    (@list
        ($bind:pat = <- $r:ident => $body:block, $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ($($tokens)*)
            ($($cases)* recv($r) -> $bind => { $body; },)
        )
    };
    // recv: Block without trailing comma.
    (@list
        ($bind:pat = <- $r:ident => $body:block $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ($($tokens)*)
            ($($cases)* recv($r) -> $bind => { $body; },)
        )
    };
    // recv: Comma is optional in last case.
    (@list
        ($bind:pat = <- $r:ident => $body:expr)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ()
            ($($cases)* recv($r) -> $bind => { $body; },)
        )
    };
    // recv: Comma is mandatory in no last case.
    (@list
        ($bind:pat = <- $r:ident => $body:expr, $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ($($tokens)*)
            ($($cases)* recv($r) -> $bind => { $body; },)
        )
    };
    // recv: Complain missing comma.
    (@list
        ($bind:pat = <- $r:ident => $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        compile_error!("expect `,` after expression in not last clause")
    };

    // send: Block with trailing comma.
    (@list
        ($bind:pat = $sender:ident <- $value:expr => $body:block, $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ($($tokens)*)
            ($($cases)* send($sender, $value) -> $bind => { $body; },)
        )
    };
    // send: Block without trailing comma.
    (@list
        ($bind:pat = $sender:ident <- $value:expr => $body:block $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ($($tokens)*)
            ($($cases)* send($sender, $value) -> $bind => { $body; },)
        )
    };
    // send: Comma is optional in last case.
    (@list
        ($bind:pat = $sender:ident <- $value:expr => $body:expr)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ()
            ($($cases)* send($sender, $value) -> $bind => { $body; },)
        )
    };
    // send: Comma is mandatory in no last case.
    (@list
        ($bind:pat = $sender:ident <- $value:expr => $body:expr, $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        $crate::select_internal!(
            @list
            ($($tokens)*)
            ($($cases)* send($sender, $value) -> $bind => { $body; },)
        )
    };
    // send: Complain missing comma.
    (@list
        ($bind:pat = $sender:ident <- $value:expr => $($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        compile_error!("expect `,` after expression in not last clause")
    };

    (@list
        ($($tokens:tt)*)
        ($($cases:tt)*)
    ) => {
        compile_error!("fail to list select clauses")
    };

    // All cases are verified, let's generate code.
    (@case
        ()
        $operations:tt
        $default:tt
    ) => {
        $crate::select_internal!(@init $operations $default)
    };

    // `default` case.
    (@case
        (default => $body:tt, $($cases:tt)*)
        $operations:tt
        ()
    ) => {
        $crate::select_internal!(
            @case
            ($($cases)*)
            $operations
            (default => $body,)
        )
    };
    // At most one `default` case.
    (@case
        (default $($unused:tt)*)
        $operations:tt
        ($($def:tt)+)
    ) => {
        compile_error!("more than one `default` case in `select` block")
    };

    // Recv case.
    (@case
        (recv($r:ident) -> $bind:pat => $body:tt, $($cases:tt)*)
        ($($operations:tt)*)
        $default:tt
    ) => {
        $crate::select_internal!(
            @case
            ($($cases)*)
            ($($operations)* recv($r) -> $bind => $body,)
            $default
        )
    };

    // Send case.
    (@case
        (send($s:ident, $v:expr) -> $bind:pat => $body:tt, $($cases:tt)*)
        ($($operations:tt)*)
        $default:tt
    ) => {
        $crate::select_internal!(
            @case
            ($($cases)*)
            ($($operations)* send($s, $v) -> $bind => $body,)
            $default
        )
    };

    // Init select.
    (@init
        $operations:tt
        $default:tt
    ) => {{
        $crate::select_internal!(
            @add
            $operations
            $default
            (
                (0x00usize)
                (0x01usize)
                (0x02usize)
                (0x03usize)
                (0x04usize)
                (0x05usize)
                (0x06usize)
                (0x07usize)
                (0x08usize)
                (0x09usize)
                (0x0ausize)
                (0x0busize)
                (0x0cusize)
                (0x0dusize)
                (0x0eusize)
                (0x0fusize)
                (0x10usize)
                (0x11usize)
                (0x12usize)
                (0x13usize)
                (0x14usize)
                (0x15usize)
                (0x16usize)
                (0x17usize)
                (0x18usize)
                (0x19usize)
                (0x1ausize)
                (0x1busize)
                (0x1cusize)
                (0x1dusize)
                (0x1eusize)
                (0x1fusize)
            )
            ()
            ()
        )
    }};

    // All actions declared, let's select!
    (@add
        ()
        ()
        $labels:tt
        ($($action:ident)*)
        $candidates:tt
    ) => {{
        let _index = {
            let mut _actions: [&mut dyn $crate::select::SelectAction; $crate::select_internal!(@count ($($action)*))] =
                [$(&mut $action),*];
            $crate::select::select(&mut _actions, false)
        };
        $crate::select_internal!(
            @match
            _index
            $candidates
            { ::std::unreachable!("select committed to no clause") }
        )
    }};

    // `select!` with `default` clause.
    (@add
        ()
        (default => $body:tt,)
        $labels:tt
        ($($action:ident)*)
        $candidates:tt
    ) => {{
        let _index = {
            let mut _actions: [&mut dyn $crate::select::SelectAction; $crate::select_internal!(@count ($($action)*))] =
                [$(&mut $action),*];
            $crate::select::select(&mut _actions, true)
        };
        $crate::select_internal!(
            @match
            _index
            $candidates
            $body
        )
    }};

    // No remaining labels.
    (@add
        $operations:tt
        $default:tt
        ()
        $actions:tt
        $candidates:tt
    ) => {
        compile_error!("too many select! clauses")
    };

    // Declare a receive action.
    (@add
        (recv($r:ident) -> $bind:pat => $body:tt, $($operations:tt)*)
        $default:tt
        (($index:tt) $($labels:tt)*)
        ($($action:ident)*)
        ($($candidates:tt)*)
    ) => {{
        let mut _action = $crate::select::RecvAction::new(&$r);
        $crate::select_internal!(
            @add
            ($($operations)*)
            $default
            ($($labels)*)
            ($($action)* _action)
            ($($candidates)* [$index] _action -> $bind => $body,)
        )
    }};

    // Declare a send action.
    (@add
        (send($s:ident, $v:expr) -> $bind:pat => $body:tt, $($operations:tt)*)
        $default:tt
        (($index:tt) $($labels:tt)*)
        ($($action:ident)*)
        ($($candidates:tt)*)
    ) => {{
        let mut _action = $crate::select::SendAction::new(&$s, $v);
        $crate::select_internal!(
            @add
            ($($operations)*)
            $default
            ($($labels)*)
            ($($action)* _action)
            ($($candidates)* [$index] _action -> $bind => $body,)
        )
    }};

    // No matching candidate: the index names the `default` clause.
    (@match
        $index:ident
        ()
        $default:tt
    ) => {
        $default
    };

    // Match a clause to the winning index.
    (@match
        $index:ident
        ([$label:tt] $action:ident -> $bind:pat => $body:tt, $($candidates:tt)*)
        $default:tt
    ) => {
        if $index == $label {
            let $bind = $action.into_result();
            #[allow(unreachable_code)]
            $body
        } else {
            $crate::select_internal!(
                @match
                $index
                ($($candidates)*)
                $default
            )
        }
    };

    // Count declared actions.
    (@count ()) => { 0 };
    (@count ($action:ident $($rest:ident)*)) => {
        1 + $crate::select_internal!(@count ($($rest)*))
    };

    // Entry points.
    () => {
        compile_error!("empty `select!` block")
    };
    ($($tokens:tt)*) => {
        $crate::select_internal!(@list ($($tokens)*) ())
    };
}
