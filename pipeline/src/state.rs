use state_machines::state_machine;

state_machine! {
    name: QueryMachine,
    state: QueryState,
    initial: Received,
    states: [Received, Retrieved, Reranked, Generating, Done, Refused, Cancelled],
    events {
        retrieve { transition: { from: Received, to: Retrieved } }
        rerank { transition: { from: Retrieved, to: Reranked } }
        generate { transition: { from: Reranked, to: Generating } }
        complete { transition: { from: Generating, to: Done } }
        refuse { transition: { from: Reranked, to: Refused } }
        cancel {
            transition: { from: Received, to: Cancelled }
            transition: { from: Retrieved, to: Cancelled }
            transition: { from: Reranked, to: Cancelled }
            transition: { from: Generating, to: Cancelled }
        }
    }
}

pub fn received() -> QueryMachine<(), Received> {
    QueryMachine::new(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_done() {
        let machine = received();
        let machine = machine.retrieve().ok().expect("retrieve");
        let machine = machine.rerank().ok().expect("rerank");
        let machine = machine.generate().ok().expect("generate");
        assert!(machine.complete().is_ok());
    }

    #[test]
    fn refusal_branches_after_rerank() {
        let machine = received();
        let machine = machine.retrieve().ok().expect("retrieve");
        let machine = machine.rerank().ok().expect("rerank");
        assert!(machine.refuse().is_ok());
    }

    #[test]
    fn cancel_is_reachable_from_every_active_state() {
        assert!(received().cancel().is_ok());

        let retrieved = received().retrieve().ok().expect("retrieve");
        assert!(retrieved.cancel().is_ok());

        let reranked = received()
            .retrieve()
            .ok()
            .expect("retrieve")
            .rerank()
            .ok()
            .expect("rerank");
        assert!(reranked.cancel().is_ok());
    }
}
